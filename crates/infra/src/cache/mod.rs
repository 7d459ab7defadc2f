//! Expiring markers ("already done today") shared between processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::InMemoryMarkerStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisMarkerStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MarkerError {
    #[error("marker backend unavailable: {0}")]
    Unavailable(String),
    #[error("marker command failed: {0}")]
    Command(String),
}

/// Key/value markers with an absolute expiry. An expired marker counts as absent.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Set only if absent; returns whether this call created the marker.
    async fn add(&self, key: &str, value: u64, expires_at: DateTime<Utc>) -> Result<bool, MarkerError>;

    async fn forget(&self, key: &str) -> Result<(), MarkerError>;
}

#[async_trait]
impl<S> MarkerStore for std::sync::Arc<S>
where
    S: MarkerStore + ?Sized,
{
    async fn add(&self, key: &str, value: u64, expires_at: DateTime<Utc>) -> Result<bool, MarkerError> {
        (**self).add(key, value, expires_at).await
    }

    async fn forget(&self, key: &str) -> Result<(), MarkerError> {
        (**self).forget(key).await
    }
}
