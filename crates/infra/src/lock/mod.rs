//! Named leases with a TTL, used to serialise work per key.
//!
//! - At most one holder per key at any instant
//! - `acquire` never waits: a held key yields `Ok(None)` immediately
//! - Leases carry an owner token; releasing only succeeds for the owner, so a
//!   holder whose lease already expired cannot free a successor's lease
//!
//! Backend failures surface as `LockError`. Callers that must fail closed use
//! [`try_acquire`], which maps errors to "not acquired".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::InMemoryLockProvider;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockProvider;

/// A held lease on a named key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub(crate) fn new(key: &str, lease: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            token: Uuid::now_v7().to_string(),
            expires_at: now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(3650)),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
    #[error("lock command failed: {0}")]
    Command(String),
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to take `key` for `lease`. `Ok(None)` means someone else holds it.
    async fn acquire(&self, key: &str, lease: Duration) -> Result<Option<Lease>, LockError>;

    /// Release a lease previously returned by `acquire`.
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}

#[async_trait]
impl<P> LockProvider for Arc<P>
where
    P: LockProvider + ?Sized,
{
    async fn acquire(&self, key: &str, lease: Duration) -> Result<Option<Lease>, LockError> {
        (**self).acquire(key, lease).await
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        (**self).release(lease).await
    }
}

/// Acquire, treating an unavailable backend as contention.
pub async fn try_acquire<P: LockProvider + ?Sized>(
    provider: &P,
    key: &str,
    lease: Duration,
) -> Option<Lease> {
    match provider.acquire(key, lease).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(key, error = %e, "lock acquisition failed; treating as held");
            None
        }
    }
}

/// Release, logging (not propagating) backend failures. The lease expires on
/// its own if the release never lands.
pub async fn release_quietly<P: LockProvider + ?Sized>(provider: &P, lease: &Lease) {
    if let Err(e) = provider.release(lease).await {
        warn!(key = %lease.key, error = %e, "lock release failed; lease will expire");
    }
}

/// A lease that is given back when dropped.
///
/// `release` gives it back in place. Dropping a still-held lease (the owning
/// future was cancelled, for instance by a timeout) spawns the release on the
/// current runtime instead of leaving the key locked until it expires.
pub struct HeldLease {
    provider: Arc<dyn LockProvider>,
    lease: Option<Lease>,
}

impl HeldLease {
    pub fn new(provider: Arc<dyn LockProvider>, lease: Lease) -> Self {
        Self {
            provider,
            lease: Some(lease),
        }
    }

    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            release_quietly(&*self.provider, &lease).await;
        }
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let provider = self.provider.clone();
                runtime.spawn(async move { release_quietly(&*provider, &lease).await });
            }
            Err(_) => warn!(key = %lease.key, "lease dropped outside a runtime; it will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn held_lease_is_released_explicitly_or_on_drop() {
        let locks = Arc::new(InMemoryLockProvider::new());
        let provider: Arc<dyn LockProvider> = locks.clone();
        let ttl = Duration::from_secs(60);

        let lease = provider.acquire("k", ttl).await.unwrap().unwrap();
        HeldLease::new(provider.clone(), lease).release().await;
        assert!(!locks.is_held("k"));

        let lease = provider.acquire("k", ttl).await.unwrap().unwrap();
        drop(HeldLease::new(provider.clone(), lease));
        for _ in 0..50 {
            if !locks.is_held("k") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!locks.is_held("k"));
        assert!(provider.acquire("k", ttl).await.unwrap().is_some());
    }
}
