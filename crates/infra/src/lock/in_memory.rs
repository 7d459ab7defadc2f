use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Lease, LockError, LockProvider};

/// Process-local lock provider for tests/dev and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryLockProvider {
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    acquisitions: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `acquire` calls seen (successful or not).
    pub fn acquire_attempts(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Whether `key` is currently held by an unexpired lease.
    pub fn is_held(&self, key: &str) -> bool {
        let now = Utc::now();
        self.leases
            .lock()
            .map(|m| m.get(key).is_some_and(|(_, exp)| *exp > now))
            .unwrap_or(false)
    }

    /// Simulate a backend outage (every call errors).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Unavailable("in-memory backend marked down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire(&self, key: &str, lease: Duration) -> Result<Option<Lease>, LockError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = Utc::now();
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| LockError::Unavailable("lock table poisoned".to_string()))?;

        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let granted = Lease::new(key, lease, now);
        leases.insert(key.to_string(), (granted.token.clone(), granted.expires_at));
        Ok(Some(granted))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        self.check_available()?;

        let mut leases = self
            .leases
            .lock()
            .map_err(|_| LockError::Unavailable("lock table poisoned".to_string()))?;

        if leases.get(&lease.key).is_some_and(|(token, _)| *token == lease.token) {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}
