//! Scripted device client for sync tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use fibernet_core::TenantId;

use crate::device_client::{DeviceClient, DeviceClientError, DeviceClientFactory, SyncReport};
use crate::devices::Device;

/// Pauses an import until released.
#[derive(Debug, Default)]
pub(crate) struct Hold {
    pub importing: Notify,
    pub release: Notify,
}

#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub connect: Result<(), DeviceClientError>,
    pub import: Result<SyncReport, DeviceClientError>,
    pub disconnect: Result<(), DeviceClientError>,
    pub hold: Option<Arc<Hold>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connect: Ok(()),
            import: Ok(SyncReport::default()),
            disconnect: Ok(()),
            hold: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedClients {
    script: Mutex<Script>,
    calls: Arc<Mutex<Vec<String>>>,
    created: AtomicUsize,
}

impl ScriptedClients {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(call)).count()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl DeviceClientFactory for ScriptedClients {
    fn create(&self, _tenant_id: TenantId) -> Box<dyn DeviceClient> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedClient {
            script: self.script.lock().unwrap().clone(),
            calls: self.calls.clone(),
        })
    }
}

struct ScriptedClient {
    script: Script,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedClient {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DeviceClient for ScriptedClient {
    fn suppress_interactive_logging(&mut self, suppress: bool) {
        self.record(format!("suppress:{suppress}"));
    }

    async fn connect(&mut self, device: &Device) -> Result<(), DeviceClientError> {
        self.record(format!("connect:{}", device.id));
        self.script.connect.clone()
    }

    async fn sync_all_to_local(&mut self) -> Result<SyncReport, DeviceClientError> {
        self.record("sync".to_string());
        if let Some(hold) = &self.script.hold {
            hold.importing.notify_one();
            hold.release.notified().await;
        }
        self.script.import.clone()
    }

    async fn disconnect(&mut self) -> Result<(), DeviceClientError> {
        self.record("disconnect".to_string());
        self.script.disconnect.clone()
    }
}
