//! Signal-history retention, run at most once per tenant per day.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};

use fibernet_core::TenantId;

use crate::cache::{MarkerError, MarkerStore};
use crate::sync::period;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetentionError {
    #[error("signal history store error: {0}")]
    Storage(String),
    #[error(transparent)]
    Marker(#[from] MarkerError),
}

#[async_trait]
pub trait SignalHistoryStore: Send + Sync {
    /// Delete the tenant's samples taken before `cutoff`; returns rows removed.
    async fn prune_before(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64, RetentionError>;
}

#[async_trait]
impl<S> SignalHistoryStore for std::sync::Arc<S>
where
    S: SignalHistoryStore + ?Sized,
{
    async fn prune_before(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64, RetentionError> {
        (**self).prune_before(tenant_id, cutoff).await
    }
}

pub fn retention_marker_key(tenant_id: TenantId, day_key: &str) -> String {
    format!("sync:retention:{tenant_id}:{day_key}")
}

/// Prunes old signal samples, guarded by a daily per-tenant marker.
pub struct SignalRetention<S, M> {
    store: S,
    markers: M,
    retention_days: u32,
    offset: FixedOffset,
}

impl<S: SignalHistoryStore, M: MarkerStore> SignalRetention<S, M> {
    pub fn new(store: S, markers: M, retention_days: u32, offset: FixedOffset) -> Self {
        Self {
            store,
            markers,
            retention_days,
            offset,
        }
    }

    /// Rows pruned, or 0 if this tenant was already pruned today.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn prune_once_per_day(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<u64, RetentionError> {
        let key = retention_marker_key(tenant_id, &period::day_key(now, self.offset));
        let claimed = self
            .markers
            .add(&key, 1, period::end_of_day(now, self.offset))
            .await?;
        if !claimed {
            debug!("retention already ran today");
            return Ok(0);
        }

        let cutoff = now - Duration::days(i64::from(self.retention_days));
        self.store.prune_before(tenant_id, cutoff).await
    }
}

/// A stored signal sample (in-memory store only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSample {
    pub tenant_id: TenantId,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemorySignalHistoryStore {
    samples: Mutex<Vec<SignalSample>>,
}

impl InMemorySignalHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tenant_id: TenantId, sampled_at: DateTime<Utc>) {
        if let Ok(mut s) = self.samples.lock() {
            s.push(SignalSample { tenant_id, sampled_at });
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SignalHistoryStore for InMemorySignalHistoryStore {
    async fn prune_before(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64, RetentionError> {
        let mut samples = self
            .samples
            .lock()
            .map_err(|_| RetentionError::Storage("signal history poisoned".to_string()))?;
        let before = samples.len();
        samples.retain(|s| s.tenant_id != tenant_id || s.sampled_at >= cutoff);
        Ok((before - samples.len()) as u64)
    }
}

/// `signal_history` table. Deployments without the table prune nothing.
#[derive(Debug, Clone)]
pub struct PostgresSignalHistoryStore {
    pool: PgPool,
}

impl PostgresSignalHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalHistoryStore for PostgresSignalHistoryStore {
    async fn prune_before(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64, RetentionError> {
        let storage = |e: sqlx::Error| RetentionError::Storage(e.to_string());

        let exists: bool = sqlx::query_scalar("SELECT to_regclass('signal_history') IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        if !exists {
            return Ok(0);
        }

        let res = sqlx::query("DELETE FROM signal_history WHERE tenant_id = $1 AND sampled_at < $2")
            .bind(tenant_id.as_i64())
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Offset, TimeZone};

    use crate::cache::InMemoryMarkerStore;

    fn tenant(n: u64) -> TenantId {
        TenantId::new(n).unwrap()
    }

    #[tokio::test]
    async fn prunes_old_samples_once_per_day() {
        let store = Arc::new(InMemorySignalHistoryStore::new());
        let now = Utc.with_ymd_and_hms(2099, 3, 10, 8, 0, 0).unwrap();
        store.push(tenant(1), now - Duration::days(120));
        store.push(tenant(1), now - Duration::days(91));
        store.push(tenant(1), now - Duration::days(10));
        store.push(tenant(2), now - Duration::days(200));

        let retention = SignalRetention::new(store.clone(), InMemoryMarkerStore::new(), 90, Utc.fix());

        assert_eq!(retention.prune_once_per_day(tenant(1), now).await.unwrap(), 2);
        store.push(tenant(1), now - Duration::days(100));
        assert_eq!(
            retention
                .prune_once_per_day(tenant(1), now + Duration::hours(2))
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.len(), 3);

        // Next day the guard is fresh.
        assert_eq!(
            retention
                .prune_once_per_day(tenant(1), now + Duration::days(1))
                .await
                .unwrap(),
            1
        );
    }
}
