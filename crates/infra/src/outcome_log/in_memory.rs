use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use fibernet_core::{DeviceId, TenantId};

use super::{
    ColumnValue, OutcomeEntry, OutcomeLogStore, OutcomeRow, OutcomeStoreError, STATUS_DONE,
    STATUS_ERROR, SchemaCapabilities, columns, summary_from_text,
};

type StoredRow = BTreeMap<String, ColumnValue>;

/// Outcome table in memory with a chosen set of columns.
#[derive(Debug)]
pub struct InMemoryOutcomeLogStore {
    columns: BTreeSet<String>,
    rows: Mutex<Vec<(i64, StoredRow)>>,
    unavailable: AtomicBool,
}

impl InMemoryOutcomeLogStore {
    pub fn with_columns<'a>(columns: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            columns: columns.into_iter().map(str::to_string).collect(),
            rows: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn current() -> Self {
        Self::with_columns(columns::CURRENT.iter().copied())
    }

    pub fn legacy() -> Self {
        Self::with_columns(columns::LEGACY.iter().copied())
    }

    /// Make every call fail, as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored rows in insertion order.
    pub fn rows(&self) -> Vec<StoredRow> {
        self.rows
            .lock()
            .map(|rows| rows.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), OutcomeStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutcomeStoreError::Storage("outcome store unavailable".to_string()));
        }
        Ok(())
    }
}

fn int(row: &StoredRow, column: &str) -> Option<i64> {
    match row.get(column)? {
        ColumnValue::Int(v) => Some(*v),
        ColumnValue::OptInt(v) => *v,
        _ => None,
    }
}

fn text(row: &StoredRow, column: &str) -> Option<String> {
    match row.get(column)? {
        ColumnValue::Text(v) => Some(v.clone()),
        ColumnValue::OptText(v) => v.clone(),
        _ => None,
    }
}

fn entry(caps: &SchemaCapabilities, id: i64, row: &StoredRow) -> Result<OutcomeEntry, OutcomeStoreError> {
    let corrupt = |e: fibernet_core::DomainError| OutcomeStoreError::Corrupt(e.to_string());
    let tenant_id = int(row, columns::TENANT_ID)
        .ok_or_else(|| OutcomeStoreError::Corrupt("missing tenant_id".to_string()))?;

    let status = text(row, columns::STATUS).or_else(|| match row.get(columns::SUCCESS) {
        Some(ColumnValue::Bool(true)) => Some(STATUS_DONE.to_string()),
        Some(ColumnValue::Bool(false)) => Some(STATUS_ERROR.to_string()),
        _ => None,
    });

    let summary = match caps.summary_column() {
        Some(columns::SUMMARY_JSON) => match row.get(columns::SUMMARY_JSON) {
            Some(ColumnValue::Json(v)) => Some(v.clone()),
            _ => None,
        },
        Some(column) => summary_from_text(text(row, column)),
        None => None,
    };

    Ok(OutcomeEntry {
        id,
        tenant_id: TenantId::from_i64(tenant_id).map_err(corrupt)?,
        device_id: int(row, columns::DEVICE_ID)
            .map(DeviceId::from_i64)
            .transpose()
            .map_err(corrupt)?,
        device_name: text(row, columns::DEVICE_NAME),
        action: text(row, columns::ACTION).unwrap_or_default(),
        status,
        summary,
        detail: caps.detail_column().and_then(|c| text(row, c)),
        actor: text(row, columns::ACTOR),
        created_at: match row.get(columns::CREATED_AT) {
            Some(ColumnValue::Timestamp(at)) => Some(*at),
            _ => None,
        },
    })
}

#[async_trait]
impl OutcomeLogStore for InMemoryOutcomeLogStore {
    async fn detect_columns(&self) -> Result<Vec<String>, OutcomeStoreError> {
        self.check_available()?;
        Ok(self.columns.iter().cloned().collect())
    }

    async fn insert(&self, row: &OutcomeRow) -> Result<i64, OutcomeStoreError> {
        self.check_available()?;
        if let Some((column, _)) = row.values().iter().find(|(c, _)| !self.columns.contains(*c)) {
            return Err(OutcomeStoreError::Storage(format!("column \"{column}\" does not exist")));
        }

        let mut rows = self
            .rows
            .lock()
            .map_err(|_| OutcomeStoreError::Storage("outcome rows poisoned".to_string()))?;
        let id = rows.len() as i64 + 1;
        rows.push((id, row.clone().into_map()));
        Ok(id)
    }

    async fn recent(
        &self,
        caps: &SchemaCapabilities,
        tenant_id: TenantId,
        device_id: Option<DeviceId>,
        limit: u32,
    ) -> Result<Vec<OutcomeEntry>, OutcomeStoreError> {
        self.check_available()?;
        let rows = self
            .rows
            .lock()
            .map_err(|_| OutcomeStoreError::Storage("outcome rows poisoned".to_string()))?;

        rows.iter()
            .rev()
            .filter(|(_, r)| int(r, columns::TENANT_ID) == Some(tenant_id.as_i64()))
            .filter(|(_, r)| device_id.is_none_or(|d| int(r, columns::DEVICE_ID) == Some(d.as_i64())))
            .take(limit as usize)
            .map(|(id, r)| entry(caps, *id, r))
            .collect()
    }
}
