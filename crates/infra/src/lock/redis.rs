//! Redis-backed leases: `SET key token NX PX ttl`, released by a
//! compare-and-delete script so only the owner can free the key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use super::{Lease, LockError, LockProvider};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockProvider {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisLockProvider {
    /// `redis_url` e.g. "redis://localhost:6379".
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: "fibernet:lock:".to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    #[instrument(skip(self), err)]
    async fn acquire(&self, key: &str, lease: Duration) -> Result<Option<Lease>, LockError> {
        let mut conn = self.connection().await?;
        let granted = Lease::new(key, lease, Utc::now());
        let ttl_ms = lease.as_millis().max(1) as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(&granted.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| LockError::Command(format!("SET NX failed: {e}")))?;

        Ok(reply.map(|_| granted))
    }

    #[instrument(skip(self, lease), fields(key = %lease.key), err)]
    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut conn = self.connection().await?;

        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.namespaced(&lease.key))
            .arg(&lease.token)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| LockError::Command(format!("release script failed: {e}")))?;

        Ok(())
    }
}
