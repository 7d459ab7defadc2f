//! Session-oriented access to OLT devices.
//!
//! The management protocol itself lives behind an external service; this
//! module only defines the contract the sync job drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fibernet_core::TenantId;

use crate::devices::Device;

mod http;

pub use http::{HttpDeviceClient, HttpDeviceClientFactory};

/// Totals reported by a full import of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncReport {
    pub synced_count: u64,
    /// Port identifiers (frame/slot/port) seen during the import.
    pub ports: Vec<String>,
    pub signal_cache_updated: u64,
    pub signal_samples_saved: u64,
    pub name_sync_processed: u64,
    pub name_sync_updated: u64,
    pub name_sync_skipped: u64,
    pub name_sync_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceClientError {
    #[error("not connected")]
    NotConnected,
    #[error("network error: {0}")]
    Network(String),
    #[error("device service error ({0}): {1}")]
    Api(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("device error: {0}")]
    Device(String),
}

/// One management session with a device.
#[async_trait]
pub trait DeviceClient: Send {
    /// Keep interactive action logging out of the device service's own audit trail.
    fn suppress_interactive_logging(&mut self, suppress: bool);

    async fn connect(&mut self, device: &Device) -> Result<(), DeviceClientError>;

    /// Import every registered subscriber unit into local storage.
    async fn sync_all_to_local(&mut self) -> Result<SyncReport, DeviceClientError>;

    async fn disconnect(&mut self) -> Result<(), DeviceClientError>;
}

/// Creates tenant-scoped clients.
pub trait DeviceClientFactory: Send + Sync {
    fn create(&self, tenant_id: TenantId) -> Box<dyn DeviceClient>;
}

impl<F> DeviceClientFactory for std::sync::Arc<F>
where
    F: DeviceClientFactory + ?Sized,
{
    fn create(&self, tenant_id: TenantId) -> Box<dyn DeviceClient> {
        (**self).create(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_tolerates_missing_fields() {
        let report: SyncReport = serde_json::from_value(serde_json::json!({
            "synced_count": 12,
            "ports": ["0/1/1"]
        }))
        .unwrap();
        assert_eq!(report.synced_count, 12);
        assert_eq!(report.ports, vec!["0/1/1".to_string()]);
        assert_eq!(report.name_sync_errors, 0);
    }
}
