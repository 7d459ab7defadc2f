//! Outcome log on Postgres.
//!
//! Column detection reads `information_schema.columns`; inserts are built
//! per-row with `QueryBuilder` from the planned column list.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use fibernet_core::{DeviceId, TenantId};

use super::{
    ColumnValue, OutcomeEntry, OutcomeLogStore, OutcomeRow, OutcomeStoreError, SchemaCapabilities,
    columns, summary_from_text,
};

pub const OUTCOME_TABLE: &str = "device_outcome_log";

#[derive(Debug, Clone)]
pub struct PostgresOutcomeLogStore {
    pool: Arc<PgPool>,
}

impl PostgresOutcomeLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage(e: sqlx::Error) -> OutcomeStoreError {
    OutcomeStoreError::Storage(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> OutcomeStoreError {
    OutcomeStoreError::Corrupt(e.to_string())
}

/// `column` if the table has it, else a typed NULL.
fn column_or_null(caps: &SchemaCapabilities, column: &str, pg_type: &str) -> String {
    if caps.has(column) {
        column.to_string()
    } else {
        format!("NULL::{pg_type}")
    }
}

fn select_list(caps: &SchemaCapabilities) -> String {
    let status = if caps.has(columns::STATUS) {
        columns::STATUS.to_string()
    } else if caps.has(columns::SUCCESS) {
        "CASE WHEN success THEN 'done' ELSE 'error' END".to_string()
    } else {
        "NULL::text".to_string()
    };
    let summary = match caps.summary_column() {
        Some(columns::SUMMARY_JSON) => "summary_json::text".to_string(),
        Some(column) => format!("{column}::text"),
        None => "NULL::text".to_string(),
    };
    let detail = caps
        .detail_column()
        .map(|c| format!("{c}::text"))
        .unwrap_or_else(|| "NULL::text".to_string());

    format!(
        "id, tenant_id, {device_id} AS device_id, {device_name} AS device_name, action, \
         {status} AS status, {summary} AS summary, {detail} AS detail, {actor} AS actor, \
         {created_at} AS created_at",
        device_id = column_or_null(caps, columns::DEVICE_ID, "bigint"),
        device_name = column_or_null(caps, columns::DEVICE_NAME, "text"),
        actor = column_or_null(caps, columns::ACTOR, "text"),
        created_at = column_or_null(caps, columns::CREATED_AT, "timestamptz"),
    )
}

#[async_trait]
impl OutcomeLogStore for PostgresOutcomeLogStore {
    async fn detect_columns(&self) -> Result<Vec<String>, OutcomeStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            "#,
        )
        .bind(OUTCOME_TABLE)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("column_name").map_err(corrupt))
            .collect()
    }

    #[instrument(skip(self, row), err)]
    async fn insert(&self, row: &OutcomeRow) -> Result<i64, OutcomeStoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("INSERT INTO {OUTCOME_TABLE} ("));
        let mut cols = qb.separated(", ");
        for (column, _) in row.values() {
            cols.push(*column);
        }
        qb.push(") VALUES (");
        let mut vals = qb.separated(", ");
        for (_, value) in row.values() {
            match value {
                ColumnValue::Int(v) => vals.push_bind(*v),
                ColumnValue::OptInt(v) => vals.push_bind(*v),
                ColumnValue::Text(v) => vals.push_bind(v.clone()),
                ColumnValue::OptText(v) => vals.push_bind(v.clone()),
                ColumnValue::Bool(v) => vals.push_bind(*v),
                ColumnValue::Json(v) => vals.push_bind(sqlx::types::Json(v.clone())),
                ColumnValue::Timestamp(v) => vals.push_bind(*v),
            };
        }
        qb.push(") RETURNING id");

        let rec = qb.build().fetch_one(&*self.pool).await.map_err(storage)?;
        rec.try_get::<i64, _>("id").map_err(corrupt)
    }

    async fn recent(
        &self,
        caps: &SchemaCapabilities,
        tenant_id: TenantId,
        device_id: Option<DeviceId>,
        limit: u32,
    ) -> Result<Vec<OutcomeEntry>, OutcomeStoreError> {
        let device_expr = column_or_null(caps, columns::DEVICE_ID, "bigint");
        let sql = format!(
            "SELECT {} FROM {OUTCOME_TABLE} \
             WHERE tenant_id = $1 AND ($2::bigint IS NULL OR {device_expr} = $2) \
             ORDER BY id DESC LIMIT $3",
            select_list(caps)
        );

        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_i64())
            .bind(device_id.map(DeviceId::as_i64))
            .bind(i64::from(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(storage)?;

        rows.iter()
            .map(|r| {
                let device_id: Option<i64> = r.try_get("device_id").map_err(corrupt)?;
                let created_at: Option<DateTime<Utc>> = r.try_get("created_at").map_err(corrupt)?;
                Ok(OutcomeEntry {
                    id: r.try_get("id").map_err(corrupt)?,
                    tenant_id: TenantId::from_i64(r.try_get("tenant_id").map_err(corrupt)?)
                        .map_err(corrupt)?,
                    device_id: device_id.map(DeviceId::from_i64).transpose().map_err(corrupt)?,
                    device_name: r.try_get("device_name").map_err(corrupt)?,
                    action: r.try_get("action").map_err(corrupt)?,
                    status: r.try_get("status").map_err(corrupt)?,
                    summary: summary_from_text(r.try_get("summary").map_err(corrupt)?),
                    detail: r.try_get("detail").map_err(corrupt)?,
                    actor: r.try_get("actor").map_err(corrupt)?,
                    created_at,
                })
            })
            .collect()
    }
}
