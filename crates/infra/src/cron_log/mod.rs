//! Best-effort record of scheduled/command runs per tenant.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;

use fibernet_core::TenantId;

use crate::outcome_log::truncate_chars;

pub const JOB_KEY_MAX_CHARS: usize = 50;
pub const COMMAND_MAX_CHARS: usize = 120;
pub const STATUS_MAX_CHARS: usize = 20;
pub const MESSAGE_MAX_CHARS: usize = 255;

/// Fold free-form statuses into `success|partial|failed|skipped|dry_run`.
pub fn normalize_status(status: &str) -> &'static str {
    match status.trim().to_ascii_lowercase().as_str() {
        "success" | "ok" | "sent" => "success",
        "partial" => "partial",
        "failed" | "fail" | "error" => "failed",
        "skipped" | "skip" | "ignored" => "skipped",
        "dry_run" => "dry_run",
        _ => "success",
    }
}

/// A finished run as reported by its caller. `tenant_id` is raw so that
/// callers without a tenant context can pass 0, which is not recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct CronRun {
    pub tenant_id: u64,
    pub job_key: String,
    pub command: String,
    pub status: String,
    pub message: String,
    pub meta: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The row actually stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CronRunRecord {
    pub tenant_id: TenantId,
    pub job_key: String,
    pub command: String,
    pub status: String,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub meta: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CronRunRecord {
    /// `None` for tenant 0.
    pub fn from_run(run: &CronRun, now: DateTime<Utc>) -> Option<Self> {
        let tenant_id = TenantId::new(run.tenant_id).ok()?;
        let message = run.message.trim();
        let meta = match &run.meta {
            serde_json::Value::Null => None,
            serde_json::Value::Object(m) if m.is_empty() => None,
            other => Some(other.clone()),
        };
        let duration_ms = match (run.started_at, run.finished_at) {
            (Some(s), Some(f)) => Some((f - s).num_milliseconds().max(0)),
            _ => None,
        };

        Some(Self {
            tenant_id,
            job_key: truncate_chars(run.job_key.trim(), JOB_KEY_MAX_CHARS),
            command: truncate_chars(run.command.trim(), COMMAND_MAX_CHARS),
            status: truncate_chars(normalize_status(&run.status), STATUS_MAX_CHARS),
            message: (!message.is_empty()).then(|| truncate_chars(message, MESSAGE_MAX_CHARS)),
            duration_ms,
            meta,
            started_at: run.started_at,
            finished_at: run.finished_at,
            created_at: now,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("cron log store error: {0}")]
pub struct CronLogError(pub String);

#[async_trait]
pub trait CronRunStore: Send + Sync {
    async fn insert(&self, record: &CronRunRecord) -> Result<(), CronLogError>;
}

pub struct CronRunRecorder<S> {
    store: S,
}

impl<S: CronRunStore> CronRunRecorder<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Record a run; returns whether a row was written.
    pub async fn record(&self, run: CronRun) -> bool {
        let Some(record) = CronRunRecord::from_run(&run, Utc::now()) else {
            return false;
        };
        match self.store.insert(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_key = %record.job_key, tenant_id = %record.tenant_id, error = %e, "failed to record cron run");
                false
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCronRunStore {
    records: Mutex<Vec<CronRunRecord>>,
}

impl InMemoryCronRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CronRunRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CronRunStore for InMemoryCronRunStore {
    async fn insert(&self, record: &CronRunRecord) -> Result<(), CronLogError> {
        self.records
            .lock()
            .map_err(|_| CronLogError("cron records poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl<S> CronRunStore for std::sync::Arc<S>
where
    S: CronRunStore + ?Sized,
{
    async fn insert(&self, record: &CronRunRecord) -> Result<(), CronLogError> {
        (**self).insert(record).await
    }
}

/// `cron_run_log` table. A missing table is reported as an error and
/// absorbed by the recorder.
#[derive(Debug, Clone)]
pub struct PostgresCronRunStore {
    pool: PgPool,
}

impl PostgresCronRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CronRunStore for PostgresCronRunStore {
    async fn insert(&self, record: &CronRunRecord) -> Result<(), CronLogError> {
        sqlx::query(
            r#"
            INSERT INTO cron_run_log
                (tenant_id, job_key, command, status, message, duration_ms, meta_json,
                 started_at, finished_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.tenant_id.as_i64())
        .bind(&record.job_key)
        .bind(&record.command)
        .bind(&record.status)
        .bind(&record.message)
        .bind(record.duration_ms)
        .bind(record.meta.clone().map(sqlx::types::Json))
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CronLogError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn run(tenant: u64, status: &str) -> CronRun {
        let started = Utc::now();
        CronRun {
            tenant_id: tenant,
            job_key: " device_daily_sync ".to_string(),
            command: "queue-daily-sync".to_string(),
            status: status.to_string(),
            message: String::new(),
            meta: serde_json::json!({ "job_count": 3 }),
            started_at: Some(started),
            finished_at: Some(started + chrono::Duration::milliseconds(250)),
        }
    }

    #[test]
    fn statuses_are_normalized() {
        assert_eq!(normalize_status("OK"), "success");
        assert_eq!(normalize_status("sent"), "success");
        assert_eq!(normalize_status(" error "), "failed");
        assert_eq!(normalize_status("fail"), "failed");
        assert_eq!(normalize_status("ignored"), "skipped");
        assert_eq!(normalize_status("dry_run"), "dry_run");
        assert_eq!(normalize_status("partial"), "partial");
        assert_eq!(normalize_status("whatever"), "success");
    }

    #[test]
    fn record_trims_caps_and_measures() {
        let mut r = run(3, "skip");
        r.message = format!("  {}  ", "m".repeat(300));
        r.command = "c".repeat(200);

        let rec = CronRunRecord::from_run(&r, Utc::now()).unwrap();
        assert_eq!(rec.job_key, "device_daily_sync");
        assert_eq!(rec.status, "skipped");
        assert_eq!(rec.command.chars().count(), COMMAND_MAX_CHARS);
        assert_eq!(rec.message.as_ref().map(|m| m.chars().count()), Some(MESSAGE_MAX_CHARS));
        assert_eq!(rec.duration_ms, Some(250));
        assert_eq!(rec.meta, Some(serde_json::json!({ "job_count": 3 })));
    }

    #[tokio::test]
    async fn tenant_zero_is_ignored() {
        let store = Arc::new(InMemoryCronRunStore::new());
        let recorder = CronRunRecorder::new(store.clone());

        assert!(!recorder.record(run(0, "success")).await);
        assert!(recorder.record(run(2, "success")).await);
        assert_eq!(store.records().len(), 1);
        assert!(store.records()[0].message.is_none());
    }
}
