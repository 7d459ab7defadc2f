//! Postgres-backed device repository.
//!
//! Every query carries `tenant_id` in its WHERE clause (or an explicit
//! cross-tenant filter for scheduler use), and soft-deleted rows are never
//! returned.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use fibernet_core::{DeviceId, TenantId};

use super::{Device, DeviceFilter, DeviceRepository, RepositoryError};

const DEVICE_COLUMNS: &str = r#"
    tenant_id, id, name, host, port, username, password,
    tcont_default, vlan_default, onu_type_default, service_port_id_default,
    is_active, inventory_cache, inventory_cached_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresDeviceRepository {
    pool: Arc<PgPool>,
}

impl PostgresDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage(context: &str, e: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(format!("{context}: {e}"))
}

fn corrupt(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Corrupt(e.to_string())
}

fn device_from_row(row: &PgRow) -> Result<Device, RepositoryError> {
    let tenant_id = TenantId::from_i64(row.try_get("tenant_id").map_err(corrupt)?).map_err(corrupt)?;
    let id = DeviceId::from_i64(row.try_get("id").map_err(corrupt)?).map_err(corrupt)?;
    let port: i32 = row.try_get("port").map_err(corrupt)?;
    let vlan: Option<i32> = row.try_get("vlan_default").map_err(corrupt)?;
    let service_port: Option<i64> = row.try_get("service_port_id_default").map_err(corrupt)?;
    let cache: Option<serde_json::Value> = row.try_get("inventory_cache").map_err(corrupt)?;

    Ok(Device {
        tenant_id,
        id,
        name: row.try_get("name").map_err(corrupt)?,
        host: row.try_get("host").map_err(corrupt)?,
        port: u16::try_from(port).map_err(corrupt)?,
        username: row.try_get("username").map_err(corrupt)?,
        password: row.try_get("password").map_err(corrupt)?,
        tcont_default: row.try_get("tcont_default").map_err(corrupt)?,
        vlan_default: vlan.map(u16::try_from).transpose().map_err(corrupt)?,
        onu_type_default: row.try_get("onu_type_default").map_err(corrupt)?,
        service_port_id_default: service_port.map(u32::try_from).transpose().map_err(corrupt)?,
        is_active: row.try_get("is_active").map_err(corrupt)?,
        inventory_cache: cache
            .map(serde_json::from_value::<Vec<String>>)
            .transpose()
            .map_err(corrupt)?,
        inventory_cached_at: row.try_get("inventory_cached_at").map_err(corrupt)?,
    })
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self), err)]
    async fn find_active(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<Option<Device>, RepositoryError> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE tenant_id = $1 AND id = $2 AND is_active AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_i64())
            .bind(device_id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("find_active", e))?;

        row.as_ref().map(device_from_row).transpose()
    }

    async fn list_active(&self, tenant_id: TenantId) -> Result<Vec<Device>, RepositoryError> {
        self.list_active_matching(DeviceFilter {
            tenant_id: Some(tenant_id),
            device_id: None,
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_active_matching(&self, filter: DeviceFilter) -> Result<Vec<Device>, RepositoryError> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE is_active AND deleted_at IS NULL \
               AND ($1::bigint IS NULL OR tenant_id = $1) \
               AND ($2::bigint IS NULL OR id = $2) \
             ORDER BY tenant_id, id"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.tenant_id.map(TenantId::as_i64))
            .bind(filter.device_id.map(DeviceId::as_i64))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage("list_active_matching", e))?;

        rows.iter().map(device_from_row).collect()
    }

    #[instrument(skip(self, ports), fields(ports = ports.len()), err)]
    async fn store_inventory_cache(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        ports: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE devices
            SET inventory_cache = $3, inventory_cached_at = $4
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_i64())
        .bind(device_id.as_i64())
        .bind(serde_json::json!(ports))
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("store_inventory_cache", e))?;

        Ok(())
    }
}
