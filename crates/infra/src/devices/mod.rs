//! Managed OLT devices as seen by the sync subsystem.
//!
//! Device rows are owned by device-management flows; this module only reads
//! them and refreshes the cached port inventory after a successful sync.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fibernet_core::{DeviceId, DomainError, TenantId};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryDeviceRepository;
pub use postgres::PostgresDeviceRepository;

/// How long a cached port inventory may be trusted, in seconds (24 hours).
pub const INVENTORY_CACHE_VALIDITY_SECS: i64 = 86_400;

/// An OLT reachable by the device-management client.
#[derive(Clone, PartialEq, Eq)]
pub struct Device {
    pub tenant_id: TenantId,
    pub id: DeviceId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tcont_default: Option<String>,
    pub vlan_default: Option<u16>,
    pub onu_type_default: Option<String>,
    pub service_port_id_default: Option<u32>,
    pub is_active: bool,
    /// Port (frame/slot/port) list last read from the device.
    pub inventory_cache: Option<Vec<String>>,
    pub inventory_cached_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("tenant_id", &self.tenant_id)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("is_active", &self.is_active)
            .field("inventory_cached_at", &self.inventory_cached_at)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Active device with telnet defaults and no cached inventory.
    pub fn new(
        tenant_id: TenantId,
        id: DeviceId,
        name: impl Into<String>,
        host: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(DomainError::validation("device host must not be empty"));
        }

        Ok(Self {
            tenant_id,
            id,
            name: name.into(),
            host,
            port: 23,
            username: String::new(),
            password: String::new(),
            tcont_default: None,
            vlan_default: None,
            onu_type_default: None,
            service_port_id_default: None,
            is_active: true,
            inventory_cache: None,
            inventory_cached_at: None,
        })
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// The cached inventory is trusted for less than 24 hours.
    pub fn is_inventory_cache_valid(&self, now: DateTime<Utc>) -> bool {
        match self.inventory_cached_at {
            Some(at) => (now - at).num_seconds() < INVENTORY_CACHE_VALIDITY_SECS,
            None => false,
        }
    }
}

/// Narrowing for bulk selection (CLI / scheduler).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub tenant_id: Option<TenantId>,
    pub device_id: Option<DeviceId>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Tenant-scoped read access to devices.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// An active device of the tenant, or `None`.
    async fn find_active(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<Option<Device>, RepositoryError>;

    /// Active devices of the tenant ordered by id.
    async fn list_active(&self, tenant_id: TenantId) -> Result<Vec<Device>, RepositoryError>;

    /// Active devices across tenants, narrowed by `filter`, ordered by (tenant, id).
    async fn list_active_matching(&self, filter: DeviceFilter) -> Result<Vec<Device>, RepositoryError>;

    /// Replace the cached port inventory.
    async fn store_inventory_cache(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        ports: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<R> DeviceRepository for std::sync::Arc<R>
where
    R: DeviceRepository + ?Sized,
{
    async fn find_active(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<Option<Device>, RepositoryError> {
        (**self).find_active(tenant_id, device_id).await
    }

    async fn list_active(&self, tenant_id: TenantId) -> Result<Vec<Device>, RepositoryError> {
        (**self).list_active(tenant_id).await
    }

    async fn list_active_matching(&self, filter: DeviceFilter) -> Result<Vec<Device>, RepositoryError> {
        (**self).list_active_matching(filter).await
    }

    async fn store_inventory_cache(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        ports: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        (**self).store_inventory_cache(tenant_id, device_id, ports, at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn device() -> Device {
        Device::new(
            TenantId::new(1).unwrap(),
            DeviceId::new(1).unwrap(),
            "OLT-A",
            "10.0.0.1",
        )
        .unwrap()
    }

    #[test]
    fn empty_host_is_rejected() {
        let err = Device::new(TenantId::new(1).unwrap(), DeviceId::new(1).unwrap(), "x", " ");
        assert!(matches!(err, Err(DomainError::Validation(_))));
    }

    #[test]
    fn inventory_cache_expires_after_a_day() {
        let now = Utc::now();
        let mut d = device();
        assert!(!d.is_inventory_cache_valid(now));

        d.inventory_cached_at = Some(now - Duration::hours(23));
        assert!(d.is_inventory_cache_valid(now));

        d.inventory_cached_at = Some(now - Duration::hours(24));
        assert!(!d.is_inventory_cache_valid(now));
    }

    #[test]
    fn debug_hides_password() {
        let d = device().with_credentials("admin", "s3cret");
        assert!(!format!("{d:?}").contains("s3cret"));
    }
}
