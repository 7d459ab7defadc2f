use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MarkerError, MarkerStore};

/// Redis marker store (`SET ... NX PXAT`).
#[derive(Debug, Clone)]
pub struct RedisMarkerStore {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisMarkerStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, MarkerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| MarkerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: "fibernet:marker:".to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, MarkerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MarkerError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl MarkerStore for RedisMarkerStore {
    async fn add(&self, key: &str, value: u64, expires_at: DateTime<Utc>) -> Result<bool, MarkerError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("PXAT")
            .arg(expires_at.timestamp_millis().max(1))
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| MarkerError::Command(format!("SET failed: {e}")))?;
        Ok(reply.is_some())
    }

    async fn forget(&self, key: &str) -> Result<(), MarkerError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| MarkerError::Command(format!("DEL failed: {e}")))?;
        Ok(())
    }
}
