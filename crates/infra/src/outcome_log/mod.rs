//! Append-only operational log of device actions.
//!
//! The table this writes to has gone through several shapes. Which columns
//! exist is detected once into [`SchemaCapabilities`] (retried on later calls
//! if the first detection fails); each write is planned against that snapshot:
//!
//! - summary goes to `summary_json`, else to the legacy text column `command`
//! - detail goes to `detail`, else to the legacy `response`
//! - a legacy boolean `success` column receives `status == "done"`
//! - `created_at` is filled when present
//! - anything the table cannot hold is dropped
//!
//! Logging never fails the caller: [`OutcomeLogger::log_action`] returns the
//! new row id or `None`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use fibernet_core::{DeviceId, TenantId};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryOutcomeLogStore;
pub use postgres::PostgresOutcomeLogStore;

pub const ACTION_MAX_CHARS: usize = 50;
pub const STATUS_MAX_CHARS: usize = 20;
pub const ACTOR_MAX_CHARS: usize = 100;
pub const DEVICE_NAME_MAX_CHARS: usize = 50;

/// Status written for a successful action; drives the legacy `success` flag.
pub const STATUS_DONE: &str = "done";
pub const STATUS_ERROR: &str = "error";

pub mod columns {
    pub const TENANT_ID: &str = "tenant_id";
    pub const DEVICE_ID: &str = "device_id";
    pub const DEVICE_NAME: &str = "device_name";
    pub const ACTION: &str = "action";
    pub const STATUS: &str = "status";
    pub const SUCCESS: &str = "success";
    pub const SUMMARY_JSON: &str = "summary_json";
    pub const COMMAND: &str = "command";
    pub const DETAIL: &str = "detail";
    pub const RESPONSE: &str = "response";
    pub const ACTOR: &str = "actor";
    pub const CREATED_AT: &str = "created_at";

    /// Current table shape.
    pub const CURRENT: &[&str] = &[
        TENANT_ID,
        DEVICE_ID,
        DEVICE_NAME,
        ACTION,
        STATUS,
        SUMMARY_JSON,
        DETAIL,
        ACTOR,
        CREATED_AT,
    ];

    /// Oldest supported shape.
    pub const LEGACY: &[&str] = &[
        TENANT_ID, DEVICE_ID, ACTION, COMMAND, RESPONSE, ACTOR, SUCCESS, CREATED_AT,
    ];
}

/// Truncate to at most `max` characters, never splitting a code point.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// Columns present on the outcome table, fixed once detected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCapabilities {
    columns: BTreeSet<String>,
}

impl SchemaCapabilities {
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(|c| c.into().to_ascii_lowercase()).collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn has(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// A row needs at least a tenant and an action to be meaningful.
    pub fn can_record(&self) -> bool {
        self.has(columns::TENANT_ID) && self.has(columns::ACTION)
    }

    pub fn summary_column(&self) -> Option<&'static str> {
        [columns::SUMMARY_JSON, columns::COMMAND]
            .into_iter()
            .find(|c| self.has(c))
    }

    pub fn detail_column(&self) -> Option<&'static str> {
        [columns::DETAIL, columns::RESPONSE].into_iter().find(|c| self.has(c))
    }

    /// Map an outcome onto the columns this table actually has.
    pub fn plan(&self, outcome: &NewOutcome, now: DateTime<Utc>) -> OutcomeRow {
        let mut row = OutcomeRow::default();
        let status = truncate_chars(&outcome.status, STATUS_MAX_CHARS);

        if self.has(columns::TENANT_ID) {
            row.push(columns::TENANT_ID, ColumnValue::Int(outcome.tenant_id.as_i64()));
        }
        if self.has(columns::DEVICE_ID) {
            row.push(
                columns::DEVICE_ID,
                ColumnValue::OptInt(outcome.device_id.map(DeviceId::as_i64)),
            );
        }
        if self.has(columns::DEVICE_NAME) {
            row.push(
                columns::DEVICE_NAME,
                ColumnValue::Text(truncate_chars(&outcome.device_name, DEVICE_NAME_MAX_CHARS)),
            );
        }
        if self.has(columns::ACTION) {
            row.push(
                columns::ACTION,
                ColumnValue::Text(truncate_chars(&outcome.action, ACTION_MAX_CHARS)),
            );
        }
        if self.has(columns::STATUS) {
            row.push(columns::STATUS, ColumnValue::Text(status.clone()));
        }
        if self.has(columns::SUCCESS) {
            row.push(columns::SUCCESS, ColumnValue::Bool(status == STATUS_DONE));
        }
        match self.summary_column() {
            Some(columns::SUMMARY_JSON) => {
                row.push(columns::SUMMARY_JSON, ColumnValue::Json(outcome.summary.clone()));
            }
            Some(column) => {
                row.push(column, ColumnValue::OptText(Some(outcome.summary.to_string())));
            }
            None => {}
        }
        if let Some(column) = self.detail_column() {
            row.push(column, ColumnValue::OptText(outcome.detail.clone()));
        }
        if self.has(columns::ACTOR) {
            row.push(
                columns::ACTOR,
                ColumnValue::OptText(
                    outcome
                        .actor
                        .as_deref()
                        .map(|a| truncate_chars(a, ACTOR_MAX_CHARS)),
                ),
            );
        }
        if self.has(columns::CREATED_AT) {
            row.push(columns::CREATED_AT, ColumnValue::Timestamp(now));
        }

        row
    }
}

/// An action outcome to record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutcome {
    pub tenant_id: TenantId,
    pub device_id: Option<DeviceId>,
    pub device_name: String,
    pub action: String,
    pub status: String,
    pub summary: serde_json::Value,
    pub detail: Option<String>,
    pub actor: Option<String>,
}

impl NewOutcome {
    pub fn new(tenant_id: TenantId, action: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            tenant_id,
            device_id: None,
            device_name: String::new(),
            action: action.into(),
            status: status.into(),
            summary: serde_json::Value::Object(Default::default()),
            detail: None,
            actor: None,
        }
    }

    pub fn for_device(mut self, device_id: DeviceId, device_name: impl Into<String>) -> Self {
        self.device_id = Some(device_id);
        self.device_name = device_name.into();
        self
    }

    pub fn summary(mut self, summary: serde_json::Value) -> Self {
        self.summary = summary;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    OptInt(Option<i64>),
    Text(String),
    OptText(Option<String>),
    Bool(bool),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

/// Column/value pairs in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeRow {
    values: Vec<(&'static str, ColumnValue)>,
}

impl OutcomeRow {
    fn push(&mut self, column: &'static str, value: ColumnValue) {
        self.values.push((column, value));
    }

    pub fn values(&self) -> &[(&'static str, ColumnValue)] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }

    pub fn into_map(self) -> BTreeMap<String, ColumnValue> {
        self.values.into_iter().map(|(c, v)| (c.to_string(), v)).collect()
    }
}

/// A logged outcome as read back. Fields the table lacks come back empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeEntry {
    pub id: i64,
    pub tenant_id: TenantId,
    pub device_id: Option<DeviceId>,
    pub device_name: Option<String>,
    pub action: String,
    pub status: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub detail: Option<String>,
    pub actor: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Parse a summary stored as text, keeping non-JSON legacy text as a string.
pub(crate) fn summary_from_text(raw: Option<String>) -> Option<serde_json::Value> {
    raw.map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)))
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OutcomeStoreError {
    #[error("outcome store error: {0}")]
    Storage(String),
    #[error("corrupt outcome row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait OutcomeLogStore: Send + Sync {
    /// Column names of the outcome table (lowercase).
    async fn detect_columns(&self) -> Result<Vec<String>, OutcomeStoreError>;

    /// Insert a planned row, returning its id.
    async fn insert(&self, row: &OutcomeRow) -> Result<i64, OutcomeStoreError>;

    /// Newest first.
    async fn recent(
        &self,
        caps: &SchemaCapabilities,
        tenant_id: TenantId,
        device_id: Option<DeviceId>,
        limit: u32,
    ) -> Result<Vec<OutcomeEntry>, OutcomeStoreError>;
}

#[async_trait]
impl<S> OutcomeLogStore for std::sync::Arc<S>
where
    S: OutcomeLogStore + ?Sized,
{
    async fn detect_columns(&self) -> Result<Vec<String>, OutcomeStoreError> {
        (**self).detect_columns().await
    }

    async fn insert(&self, row: &OutcomeRow) -> Result<i64, OutcomeStoreError> {
        (**self).insert(row).await
    }

    async fn recent(
        &self,
        caps: &SchemaCapabilities,
        tenant_id: TenantId,
        device_id: Option<DeviceId>,
        limit: u32,
    ) -> Result<Vec<OutcomeEntry>, OutcomeStoreError> {
        (**self).recent(caps, tenant_id, device_id, limit).await
    }
}

/// Detect the table shape. A table without `tenant_id`/`action` is detected
/// fine but records nothing.
pub async fn detect_capabilities<S: OutcomeLogStore + ?Sized>(
    store: &S,
) -> Result<SchemaCapabilities, OutcomeStoreError> {
    let caps = SchemaCapabilities::from_columns(store.detect_columns().await?);
    if !caps.can_record() {
        warn!(?caps, "outcome table lacks tenant_id/action; outcomes will not be recorded");
    }
    Ok(caps)
}

pub struct OutcomeLogger<S> {
    store: S,
    /// `None` until detection succeeds.
    caps: RwLock<Option<SchemaCapabilities>>,
}

impl<S: OutcomeLogStore> OutcomeLogger<S> {
    pub fn new(store: S, caps: SchemaCapabilities) -> Self {
        Self {
            store,
            caps: RwLock::new(Some(caps)),
        }
    }

    /// Detect the table shape now. If that fails, detection is retried on
    /// each later call until it succeeds.
    pub async fn detect(store: S) -> Self {
        let logger = Self {
            store,
            caps: RwLock::new(None),
        };
        logger.current_capabilities().await;
        logger
    }

    /// The detected shape, or `None` while detection keeps failing.
    pub fn capabilities(&self) -> Option<SchemaCapabilities> {
        self.caps.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn current_capabilities(&self) -> Option<SchemaCapabilities> {
        if let Some(caps) = self.capabilities() {
            return Some(caps);
        }
        match detect_capabilities(&self.store).await {
            Ok(caps) => {
                *self.caps.write().unwrap_or_else(PoisonError::into_inner) = Some(caps.clone());
                Some(caps)
            }
            Err(e) => {
                warn!(error = %e, "outcome table detection failed; will retry on next use");
                None
            }
        }
    }

    /// Record an outcome. Returns the new id, or `None` when nothing was written.
    pub async fn log_action(&self, outcome: NewOutcome) -> Option<i64> {
        let caps = match self.current_capabilities().await {
            Some(caps) if caps.can_record() => caps,
            _ => {
                debug!(action = %outcome.action, "outcome not recorded: table unsupported or undetected");
                return None;
            }
        };

        let row = caps.plan(&outcome, Utc::now());
        match self.store.insert(&row).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    tenant_id = %outcome.tenant_id,
                    action = %outcome.action,
                    error = %e,
                    "failed to record outcome"
                );
                None
            }
        }
    }

    pub async fn recent(
        &self,
        tenant_id: TenantId,
        device_id: Option<DeviceId>,
        limit: u32,
    ) -> Result<Vec<OutcomeEntry>, OutcomeStoreError> {
        let caps = match self.current_capabilities().await {
            Some(caps) if caps.can_record() => caps,
            _ => return Ok(Vec::new()),
        };
        self.store.recent(&caps, tenant_id, device_id, limit).await
    }
}
