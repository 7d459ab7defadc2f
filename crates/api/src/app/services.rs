//! Infrastructure wiring: storage backends, the dispatch gate, the sync job
//! and the executor that runs it.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use fibernet_auth::{CapabilityPolicy, FirstMatchPolicy, LegacyRolePolicy, RbacPolicy};
use fibernet_infra::cache::{InMemoryMarkerStore, MarkerStore};
use fibernet_infra::config::SyncConfig;
use fibernet_infra::cron_log::{
    CronRunRecorder, CronRunStore, InMemoryCronRunStore, PostgresCronRunStore,
};
use fibernet_infra::device_client::{DeviceClientFactory, HttpDeviceClientFactory};
use fibernet_infra::devices::{DeviceRepository, InMemoryDeviceRepository, PostgresDeviceRepository};
use fibernet_infra::jobs::{DEVICE_SYNC_KIND, InMemoryJobStore, JobExecutor, JobExecutorConfig};
use fibernet_infra::lock::{InMemoryLockProvider, LockProvider};
use fibernet_infra::outcome_log::{
    InMemoryOutcomeLogStore, OutcomeLogStore, OutcomeLogger, PostgresOutcomeLogStore,
};
use fibernet_infra::retention::{
    InMemorySignalHistoryStore, PostgresSignalHistoryStore, SignalHistoryStore, SignalRetention,
};
use fibernet_infra::sync::{
    DailySyncDispatcher, DeviceSyncHandler, DeviceSyncJob, DispatchSettings, SharedOutcomeLogger,
};

pub type SharedCronRecorder = Arc<CronRunRecorder<Arc<dyn CronRunStore>>>;

/// Storage and collaborator choices, before anything is wired together.
pub struct Backends {
    pub devices: Arc<dyn DeviceRepository>,
    pub markers: Arc<dyn MarkerStore>,
    pub locks: Arc<dyn LockProvider>,
    pub outcomes: Arc<dyn OutcomeLogStore>,
    pub cron_runs: Arc<dyn CronRunStore>,
    pub signal_history: Arc<dyn SignalHistoryStore>,
    pub clients: Arc<dyn DeviceClientFactory>,
}

impl Backends {
    /// Process-local backends (dev/test).
    pub fn in_memory(devices: Arc<dyn DeviceRepository>, clients: Arc<dyn DeviceClientFactory>) -> Self {
        Self {
            devices,
            markers: Arc::new(InMemoryMarkerStore::new()),
            locks: Arc::new(InMemoryLockProvider::new()),
            outcomes: Arc::new(InMemoryOutcomeLogStore::current()),
            cron_runs: Arc::new(InMemoryCronRunStore::new()),
            signal_history: Arc::new(InMemorySignalHistoryStore::new()),
            clients,
        }
    }

    /// Pick backends from configuration: Postgres when `DATABASE_URL` is set,
    /// Redis for locks and markers when `REDIS_URL` is set (and the `redis`
    /// feature is enabled), in-memory otherwise.
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let base_url = config
            .device_service_url
            .clone()
            .context("DEVICE_SERVICE_URL must be set")?;
        let clients: Arc<dyn DeviceClientFactory> = Arc::new(HttpDeviceClientFactory::new(base_url));

        let mut backends = match &config.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("failed to connect to Postgres")?;
                tracing::info!("using Postgres stores");
                Self {
                    devices: Arc::new(PostgresDeviceRepository::new(pool.clone())),
                    outcomes: Arc::new(PostgresOutcomeLogStore::new(pool.clone())),
                    cron_runs: Arc::new(PostgresCronRunStore::new(pool.clone())),
                    signal_history: Arc::new(PostgresSignalHistoryStore::new(pool)),
                    ..Self::in_memory(Arc::new(InMemoryDeviceRepository::new()), clients)
                }
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory stores");
                Self::in_memory(Arc::new(InMemoryDeviceRepository::new()), clients)
            }
        };

        if let Some(redis_url) = &config.redis_url {
            backends.use_redis(redis_url)?;
        } else {
            tracing::warn!("REDIS_URL not set; locks and markers are process-local");
        }

        Ok(backends)
    }

    #[cfg(feature = "redis")]
    fn use_redis(&mut self, redis_url: &str) -> anyhow::Result<()> {
        use fibernet_infra::cache::RedisMarkerStore;
        use fibernet_infra::lock::RedisLockProvider;

        self.locks = Arc::new(RedisLockProvider::new(redis_url).context("invalid REDIS_URL")?);
        self.markers = Arc::new(RedisMarkerStore::new(redis_url).context("invalid REDIS_URL")?);
        tracing::info!("using Redis locks and markers");
        Ok(())
    }

    #[cfg(not(feature = "redis"))]
    fn use_redis(&mut self, _redis_url: &str) -> anyhow::Result<()> {
        tracing::warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory");
        Ok(())
    }
}

/// Everything the HTTP surface, the scheduler and the CLI share.
pub struct AppServices {
    pub config: SyncConfig,
    pub devices: Arc<dyn DeviceRepository>,
    pub markers: Arc<dyn MarkerStore>,
    pub jobs: Arc<InMemoryJobStore>,
    pub dispatcher: Arc<DailySyncDispatcher>,
    pub sync_job: Arc<DeviceSyncJob>,
    pub outcomes: SharedOutcomeLogger,
    pub cron: SharedCronRecorder,
    pub policy: Arc<dyn CapabilityPolicy>,
}

impl AppServices {
    /// Wire the services. Detects the outcome table shape up front.
    pub async fn new(config: SyncConfig, backends: Backends) -> Self {
        let outcomes: SharedOutcomeLogger = Arc::new(OutcomeLogger::detect(backends.outcomes).await);

        let retention = Arc::new(SignalRetention::new(
            backends.signal_history,
            backends.markers.clone(),
            config.signal_retention_days,
            config.utc_offset,
        ));
        let sync_job = Arc::new(
            DeviceSyncJob::new(
                backends.devices.clone(),
                backends.locks,
                backends.clients,
                outcomes.clone(),
                config.lock_lease,
            )
            .with_retention(retention),
        );

        let jobs = InMemoryJobStore::arc();
        let dispatcher = Arc::new(DailySyncDispatcher::new(
            backends.devices.clone(),
            backends.markers.clone(),
            jobs.clone(),
            DispatchSettings::from_config(&config),
        ));

        let policy: Arc<dyn CapabilityPolicy> = Arc::new(FirstMatchPolicy::rbac_then_legacy(
            RbacPolicy::standard(),
            LegacyRolePolicy::default(),
        ));

        Self {
            devices: backends.devices,
            markers: backends.markers,
            jobs,
            dispatcher,
            sync_job,
            outcomes,
            cron: Arc::new(CronRunRecorder::new(backends.cron_runs)),
            policy,
            config,
        }
    }

    /// A dispatcher enqueueing onto `queue` instead of the configured one.
    pub fn dispatcher_for_queue(&self, queue: &str) -> DailySyncDispatcher {
        DailySyncDispatcher::new(
            self.devices.clone(),
            self.markers.clone(),
            self.jobs.clone(),
            self.dispatcher.settings().clone().with_queue(queue),
        )
    }

    /// Executor draining `queue` with the sync handler registered.
    pub fn executor(&self, queue: &str) -> JobExecutor<InMemoryJobStore> {
        let config = JobExecutorConfig::default()
            .with_name(format!("sync-executor:{queue}"))
            .with_queue(queue)
            .with_max_concurrent(self.config.executor_concurrency);

        let mut executor = JobExecutor::new(self.jobs.clone(), config);
        executor.register_handler(DEVICE_SYNC_KIND, Arc::new(DeviceSyncHandler::new(self.sync_job.clone())));
        executor
    }
}

/// Wire services from configuration.
pub async fn build_services(config: SyncConfig) -> anyhow::Result<AppServices> {
    let backends = Backends::from_config(&config).await?;
    Ok(AppServices::new(config, backends).await)
}
