use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MarkerError, MarkerStore};

/// In-memory marker store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryMarkerStore {
    inner: RwLock<HashMap<String, (u64, DateTime<Utc>)>>,
}

impl InMemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live marker.
    pub fn value(&self, key: &str) -> Option<u64> {
        let now = Utc::now();
        let map = self.inner.read().ok()?;
        map.get(key).filter(|(_, exp)| *exp > now).map(|(v, _)| *v)
    }

    /// Keys of live markers starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Utc::now();
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(k, (_, exp))| k.starts_with(prefix) && *exp > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

fn poisoned() -> MarkerError {
    MarkerError::Unavailable("marker table poisoned".to_string())
}

#[async_trait]
impl MarkerStore for InMemoryMarkerStore {
    async fn add(&self, key: &str, value: u64, expires_at: DateTime<Utc>) -> Result<bool, MarkerError> {
        let now = Utc::now();
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        if map.get(key).is_some_and(|(_, exp)| *exp > now) {
            return Ok(false);
        }
        map.insert(key.to_string(), (value, expires_at));
        Ok(true)
    }

    async fn forget(&self, key: &str) -> Result<(), MarkerError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        map.remove(key);
        Ok(())
    }
}
