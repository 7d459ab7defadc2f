//! Once-per-day dispatch of device sync jobs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, info, instrument, warn};

use fibernet_core::{DeviceId, TenantId};

use crate::cache::{MarkerError, MarkerStore};
use crate::config::SyncConfig;
use crate::devices::{DeviceFilter, DeviceRepository, RepositoryError};
use crate::jobs::{Job, JobStore, JobStoreError, RetryPolicy};

use super::period;

/// Dispatch markers outlive the day by this much.
fn marker_grace() -> chrono::Duration {
    chrono::Duration::minutes(10)
}

pub fn dispatch_marker_key(tenant_id: TenantId, device_id: DeviceId, day_key: &str) -> String {
    format!("sync:dispatched:{tenant_id}:{device_id}:{day_key}")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Marker(#[from] MarkerError),
    #[error("enqueue failed: {0}")]
    Queue(#[from] JobStoreError),
}

/// How dispatched jobs are shaped.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub queue: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub job_timeout: Duration,
    pub utc_offset: FixedOffset,
}

impl DispatchSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
            job_timeout: config.job_timeout,
            utc_offset: config.utc_offset,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn job_for(&self, tenant_id: TenantId, device_id: DeviceId) -> Job {
        Job::device_sync(tenant_id, device_id)
            .on_queue(self.queue.clone())
            .with_retry_policy(RetryPolicy::fixed(self.max_attempts, self.retry_delay))
            .with_timeout(self.job_timeout)
    }
}

pub struct DailySyncDispatcher {
    devices: Arc<dyn DeviceRepository>,
    markers: Arc<dyn MarkerStore>,
    jobs: Arc<dyn JobStore>,
    settings: DispatchSettings,
}

impl DailySyncDispatcher {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        markers: Arc<dyn MarkerStore>,
        jobs: Arc<dyn JobStore>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            devices,
            markers,
            jobs,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Enqueue today's sync for each active device of the tenant that has not
    /// been dispatched yet. Returns the number of jobs enqueued.
    pub async fn dispatch_for_tenant_once_per_day(&self, tenant_id: TenantId) -> Result<usize, DispatchError> {
        self.dispatch_for_tenant_on(tenant_id, Utc::now()).await
    }

    /// [`Self::dispatch_for_tenant_once_per_day`] with an explicit clock.
    #[instrument(skip(self, now), fields(tenant_id = %tenant_id), err)]
    pub async fn dispatch_for_tenant_on(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<usize, DispatchError> {
        let devices = self.devices.list_active(tenant_id).await?;
        if devices.is_empty() {
            debug!("no active devices");
            return Ok(0);
        }

        let day_key = period::day_key(now, self.settings.utc_offset);
        let expires_at = period::end_of_day(now, self.settings.utc_offset) + marker_grace();

        let mut count = 0;
        for device in devices {
            let key = dispatch_marker_key(device.tenant_id, device.id, &day_key);
            if !self.markers.add(&key, 1, expires_at).await? {
                continue;
            }

            if let Err(e) = self.jobs.enqueue(self.settings.job_for(device.tenant_id, device.id)) {
                if let Err(forget) = self.markers.forget(&key).await {
                    warn!(key = %key, error = %forget, "failed to forget dispatch marker");
                }
                return Err(e.into());
            }
            count += 1;
        }

        if count > 0 {
            info!(count, queue = %self.settings.queue, "daily device sync dispatched");
        }
        Ok(count)
    }

    /// Enqueue a sync for every active device matching `filter`, ignoring
    /// today's markers. Returns jobs enqueued per tenant.
    #[instrument(skip(self), err)]
    pub async fn dispatch_all(&self, filter: DeviceFilter) -> Result<BTreeMap<TenantId, usize>, DispatchError> {
        let devices = self.devices.list_active_matching(filter).await?;
        let mut per_tenant = BTreeMap::new();
        for device in devices {
            self.jobs
                .enqueue(self.settings.job_for(device.tenant_id, device.id))?;
            *per_tenant.entry(device.tenant_id).or_insert(0) += 1;
        }
        Ok(per_tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::cache::InMemoryMarkerStore;
    use crate::devices::{Device, InMemoryDeviceRepository};
    use crate::jobs::{InMemoryJobStore, Job, JobId, JobKind, JobStats, JobStatus, ClaimFilter};

    fn tenant(n: u64) -> TenantId {
        TenantId::new(n).unwrap()
    }

    fn device(t: u64, d: u64) -> Device {
        Device::new(tenant(t), DeviceId::new(d).unwrap(), format!("OLT-{d}"), "10.0.0.1").unwrap()
    }

    fn settings() -> DispatchSettings {
        DispatchSettings::from_config(&SyncConfig::default())
    }

    // Markers expire against the wall clock, so pin a day in the future.
    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2099, 6, d, h, 0, 0).unwrap()
    }

    struct Fixture {
        markers: Arc<InMemoryMarkerStore>,
        jobs: Arc<InMemoryJobStore>,
        dispatcher: DailySyncDispatcher,
    }

    fn fixture(devices: Vec<Device>) -> Fixture {
        let markers = Arc::new(InMemoryMarkerStore::new());
        let jobs = InMemoryJobStore::arc();
        let dispatcher = DailySyncDispatcher::new(
            Arc::new(InMemoryDeviceRepository::with_devices(devices)),
            markers.clone(),
            jobs.clone(),
            settings(),
        );
        Fixture {
            markers,
            jobs,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn no_devices_means_no_markers_and_no_jobs() {
        let f = fixture(vec![device(2, 1)]);

        let n = f.dispatcher.dispatch_for_tenant_on(tenant(1), day(1, 8)).await.unwrap();
        assert_eq!(n, 0);
        assert!(f.markers.keys_with_prefix("sync:").is_empty());
        assert!(f.jobs.snapshot().is_empty());
    }

    #[tokio::test]
    async fn twice_in_a_day_dispatches_each_device_once() {
        let f = fixture(vec![device(1, 1), device(1, 2), device(1, 3).inactive()]);

        assert_eq!(f.dispatcher.dispatch_for_tenant_on(tenant(1), day(1, 8)).await.unwrap(), 2);
        assert_eq!(f.dispatcher.dispatch_for_tenant_on(tenant(1), day(1, 20)).await.unwrap(), 0);

        let jobs = f.jobs.snapshot();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.queue == "device-sync"));
        assert!(jobs.iter().all(|j| j.retry_policy.max_attempts == 2));
        assert!(jobs.iter().all(|j| j.timeout == Some(Duration::from_secs(7200))));
        assert_eq!(
            f.markers.keys_with_prefix("sync:dispatched:1:"),
            vec!["sync:dispatched:1:1:20990601", "sync:dispatched:1:2:20990601"]
        );

        // A new day is a new period.
        assert_eq!(f.dispatcher.dispatch_for_tenant_on(tenant(1), day(2, 8)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn device_added_later_in_the_day_is_still_dispatched() {
        let devices = Arc::new(InMemoryDeviceRepository::with_devices([device(1, 1)]));
        let jobs = InMemoryJobStore::arc();
        let dispatcher = DailySyncDispatcher::new(
            devices.clone(),
            Arc::new(InMemoryMarkerStore::new()),
            jobs.clone(),
            settings(),
        );

        assert_eq!(dispatcher.dispatch_for_tenant_on(tenant(1), day(1, 8)).await.unwrap(), 1);
        devices.upsert(device(1, 5));
        assert_eq!(dispatcher.dispatch_for_tenant_on(tenant(1), day(1, 9)).await.unwrap(), 1);
        assert_eq!(jobs.snapshot().len(), 2);
    }

    /// Refuses every enqueue.
    struct BrokenQueue;

    impl JobStore for BrokenQueue {
        fn enqueue(&self, _job: Job) -> Result<JobId, JobStoreError> {
            Err(JobStoreError::Storage("queue down".into()))
        }
        fn get(&self, _t: TenantId, _id: JobId) -> Result<Option<Job>, JobStoreError> {
            Ok(None)
        }
        fn update(&self, _job: &Job) -> Result<(), JobStoreError> {
            Ok(())
        }
        fn claim_next(&self, _f: &ClaimFilter) -> Result<Option<Job>, JobStoreError> {
            Ok(None)
        }
        fn has_outstanding(&self, _f: &ClaimFilter) -> Result<bool, JobStoreError> {
            Ok(false)
        }
        fn list_by_status(&self, _t: TenantId, _s: Option<JobStatus>, _l: usize) -> Result<Vec<Job>, JobStoreError> {
            Ok(vec![])
        }
        fn dead_letter(&self, _job: Job, _r: String) -> Result<(), JobStoreError> {
            Ok(())
        }
        fn stats(&self, _t: TenantId) -> Result<JobStats, JobStoreError> {
            Ok(JobStats::default())
        }
    }

    #[tokio::test]
    async fn failed_enqueue_forgets_the_marker() {
        let markers = Arc::new(InMemoryMarkerStore::new());
        let dispatcher = DailySyncDispatcher::new(
            Arc::new(InMemoryDeviceRepository::with_devices([device(1, 1)])),
            markers.clone(),
            Arc::new(BrokenQueue),
            settings(),
        );

        let err = dispatcher.dispatch_for_tenant_on(tenant(1), day(1, 8)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Queue(_)));
        assert!(markers.keys_with_prefix("sync:dispatched:").is_empty());
    }

    #[tokio::test]
    async fn dispatch_all_ignores_markers_and_counts_per_tenant() {
        let f = fixture(vec![device(1, 1), device(1, 2), device(2, 3)]);
        f.dispatcher.dispatch_for_tenant_on(tenant(1), day(1, 8)).await.unwrap();

        let counts = f.dispatcher.dispatch_all(DeviceFilter::default()).await.unwrap();
        assert_eq!(counts.get(&tenant(1)), Some(&2));
        assert_eq!(counts.get(&tenant(2)), Some(&1));
        assert_eq!(f.jobs.snapshot().len(), 5);

        let narrowed = f
            .dispatcher
            .dispatch_all(DeviceFilter {
                tenant_id: Some(tenant(2)),
                device_id: None,
            })
            .await
            .unwrap();
        assert_eq!(narrowed.len(), 1);
        assert!(matches!(f.jobs.snapshot()[0].kind, JobKind::DeviceSync { .. }));
    }
}
