use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fibernet_core::{DeviceId, TenantId};

use super::{Device, DeviceFilter, DeviceRepository, RepositoryError};

/// In-memory device table for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeviceRepository {
    inner: RwLock<BTreeMap<(TenantId, DeviceId), Device>>,
}

impl InMemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let repo = Self::new();
        for d in devices {
            repo.upsert(d);
        }
        repo
    }

    pub fn upsert(&self, device: Device) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((device.tenant_id, device.id), device);
        }
    }

    /// Any device row regardless of status.
    pub fn get(&self, tenant_id: TenantId, device_id: DeviceId) -> Option<Device> {
        self.inner.read().ok()?.get(&(tenant_id, device_id)).cloned()
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Storage("device table poisoned".to_string())
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn find_active(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<Option<Device>, RepositoryError> {
        let map = self.inner.read().map_err(|_| poisoned())?;
        Ok(map
            .get(&(tenant_id, device_id))
            .filter(|d| d.is_active)
            .cloned())
    }

    async fn list_active(&self, tenant_id: TenantId) -> Result<Vec<Device>, RepositoryError> {
        self.list_active_matching(DeviceFilter {
            tenant_id: Some(tenant_id),
            device_id: None,
        })
        .await
    }

    async fn list_active_matching(&self, filter: DeviceFilter) -> Result<Vec<Device>, RepositoryError> {
        let map = self.inner.read().map_err(|_| poisoned())?;
        Ok(map
            .values()
            .filter(|d| {
                d.is_active
                    && filter.tenant_id.is_none_or(|t| d.tenant_id == t)
                    && filter.device_id.is_none_or(|id| d.id == id)
            })
            .cloned()
            .collect())
    }

    async fn store_inventory_cache(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        ports: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        if let Some(device) = map.get_mut(&(tenant_id, device_id)) {
            device.inventory_cache = Some(ports.to_vec());
            device.inventory_cached_at = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(n: u64) -> TenantId {
        TenantId::new(n).unwrap()
    }

    fn device(t: u64, d: u64) -> Device {
        Device::new(tenant(t), DeviceId::new(d).unwrap(), format!("OLT-{d}"), "10.0.0.1").unwrap()
    }

    #[tokio::test]
    async fn inactive_and_foreign_devices_are_invisible() {
        let repo = InMemoryDeviceRepository::with_devices([
            device(1, 1),
            device(1, 2).inactive(),
            device(2, 3),
        ]);

        let active = repo.list_active(tenant(1)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.get(), 1);

        assert!(repo.find_active(tenant(1), DeviceId::new(2).unwrap()).await.unwrap().is_none());
        assert!(repo.find_active(tenant(1), DeviceId::new(3).unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filter_spans_tenants_in_order() {
        let repo = InMemoryDeviceRepository::with_devices([device(2, 5), device(1, 4), device(1, 1)]);

        let all = repo.list_active_matching(DeviceFilter::default()).await.unwrap();
        let ids: Vec<u64> = all.iter().map(|d| d.id.get()).collect();
        assert_eq!(ids, vec![1, 4, 5]);

        let one = repo
            .list_active_matching(DeviceFilter {
                tenant_id: None,
                device_id: Some(DeviceId::new(5).unwrap()),
            })
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }
}
