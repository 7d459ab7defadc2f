//! One lock-guarded import of one device.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use fibernet_core::{DeviceId, TenantId};

use crate::device_client::{DeviceClient, DeviceClientError, DeviceClientFactory, SyncReport};
use crate::devices::{Device, DeviceRepository, RepositoryError};
use crate::lock::{HeldLease, LockProvider, try_acquire};
use crate::outcome_log::{NewOutcome, STATUS_DONE, STATUS_ERROR};

use super::{SharedOutcomeLogger, SharedRetention};

pub const SYNC_ACTION: &str = "sync_daily";
pub const SYNC_ACTOR: &str = "scheduler";
pub const SYNC_MODE: &str = "scheduled_daily";

pub fn sync_lock_key(tenant_id: TenantId, device_id: DeviceId) -> String {
    format!("sync:{tenant_id}:{device_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    LockAcquired,
    Connected,
    Importing,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Pending => "pending",
            SyncState::LockAcquired => "lock_acquired",
            SyncState::Connected => "connected",
            SyncState::Importing => "importing",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn transition(state: &mut SyncState, next: SyncState) {
    debug!(from = %state, to = %next, "sync state");
    *state = next;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Device missing, inactive, or owned by another tenant.
    NotFound,
    /// Another run holds the lock, or the lock backend is down.
    LockHeld,
}

/// Summary written to the outcome log for a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub mode: &'static str,
    pub count: u64,
    pub port_count: usize,
    pub signal_cache_updated: u64,
    pub signal_samples_saved: u64,
    pub name_sync_processed: u64,
    pub name_sync_updated: u64,
    pub name_sync_skipped: u64,
    pub name_sync_errors: u64,
    pub retention_pruned: u64,
    pub retention_error: Option<String>,
}

impl SyncSummary {
    fn from_report(report: &SyncReport) -> Self {
        Self {
            mode: SYNC_MODE,
            count: report.synced_count,
            port_count: report.ports.len(),
            signal_cache_updated: report.signal_cache_updated,
            signal_samples_saved: report.signal_samples_saved,
            name_sync_processed: report.name_sync_processed,
            name_sync_updated: report.name_sync_updated,
            name_sync_skipped: report.name_sync_skipped,
            name_sync_errors: report.name_sync_errors,
            retention_pruned: 0,
            retention_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRunOutcome {
    Completed(SyncSummary),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Device(#[from] DeviceClientError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("device session timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Result of closing a device session. Never affects the run's result.
#[derive(Debug)]
enum DisconnectOutcome {
    Closed,
    Failed(DeviceClientError),
}

impl From<Result<(), DeviceClientError>> for DisconnectOutcome {
    fn from(res: Result<(), DeviceClientError>) -> Self {
        match res {
            Ok(()) => Self::Closed,
            Err(e) => Self::Failed(e),
        }
    }
}

/// Imports one device under the `sync:{tenant}:{device}` lock.
///
/// - At most one run per (tenant, device) at a time; a run that cannot take
///   the lock touches nothing
/// - The device session is closed exactly once whatever happens after it
///   was opened
/// - Every run that took the lock writes exactly one outcome entry
/// - A time limit, when given, bounds the device session; a session that
///   runs over is abandoned, closed, and logged as an error
pub struct DeviceSyncJob {
    devices: Arc<dyn DeviceRepository>,
    locks: Arc<dyn LockProvider>,
    clients: Arc<dyn DeviceClientFactory>,
    outcomes: SharedOutcomeLogger,
    retention: Option<SharedRetention>,
    lease: Duration,
}

impl DeviceSyncJob {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        locks: Arc<dyn LockProvider>,
        clients: Arc<dyn DeviceClientFactory>,
        outcomes: SharedOutcomeLogger,
        lease: Duration,
    ) -> Self {
        Self {
            devices,
            locks,
            clients,
            outcomes,
            retention: None,
            lease,
        }
    }

    pub fn with_retention(mut self, retention: SharedRetention) -> Self {
        self.retention = Some(retention);
        self
    }

    pub async fn run(&self, tenant_id: TenantId, device_id: DeviceId) -> Result<SyncRunOutcome, SyncError> {
        self.run_within(tenant_id, device_id, None).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, device_id = %device_id))]
    pub async fn run_within(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        limit: Option<Duration>,
    ) -> Result<SyncRunOutcome, SyncError> {
        let mut state = SyncState::Pending;

        let Some(device) = self.devices.find_active(tenant_id, device_id).await? else {
            debug!("device not found or inactive; skipping");
            return Ok(SyncRunOutcome::Skipped(SkipReason::NotFound));
        };

        let key = sync_lock_key(tenant_id, device_id);
        let Some(lease) = try_acquire(&*self.locks, &key, self.lease).await else {
            debug!(key = %key, "sync already running; skipping");
            return Ok(SyncRunOutcome::Skipped(SkipReason::LockHeld));
        };
        let lease = HeldLease::new(self.locks.clone(), lease);
        transition(&mut state, SyncState::LockAcquired);

        match self.import(&device, &mut state, limit).await {
            Ok(report) => {
                let now = Utc::now();
                self.refresh_inventory_cache(&device, &report, now).await;

                let mut summary = SyncSummary::from_report(&report);
                self.apply_retention(tenant_id, now, &mut summary).await;

                lease.release().await;
                transition(&mut state, SyncState::Done);

                self.outcomes
                    .log_action(
                        NewOutcome::new(tenant_id, SYNC_ACTION, STATUS_DONE)
                            .for_device(device.id, device.name.clone())
                            .summary(serde_json::to_value(&summary).unwrap_or_default())
                            .actor(SYNC_ACTOR),
                    )
                    .await;

                info!(count = summary.count, ports = summary.port_count, "device sync done");
                Ok(SyncRunOutcome::Completed(summary))
            }
            Err(e) => {
                transition(&mut state, SyncState::Failed);
                let message = e.to_string();

                self.outcomes
                    .log_action(
                        NewOutcome::new(tenant_id, SYNC_ACTION, STATUS_ERROR)
                            .for_device(device.id, device.name.clone())
                            .summary(serde_json::json!({ "mode": SYNC_MODE, "message": message }))
                            .detail(message.clone())
                            .actor(SYNC_ACTOR),
                    )
                    .await;

                lease.release().await;
                warn!(error = %message, "device sync failed");
                Err(e)
            }
        }
    }

    /// Open a session, import, and close the session.
    async fn import(
        &self,
        device: &Device,
        state: &mut SyncState,
        limit: Option<Duration>,
    ) -> Result<SyncReport, SyncError> {
        let mut client = self.clients.create(device.tenant_id);
        client.suppress_interactive_logging(true);

        let session = connect_and_import(client.as_mut(), device, state);
        let imported = match limit {
            Some(limit) => match tokio::time::timeout(limit, session).await {
                Ok(res) => res.map_err(SyncError::from),
                Err(_) => Err(SyncError::TimedOut(limit)),
            },
            None => session.await.map_err(SyncError::from),
        };

        if let DisconnectOutcome::Failed(e) = DisconnectOutcome::from(client.disconnect().await) {
            debug!(error = %e, "disconnect failed; ignored");
        }

        imported
    }

    async fn refresh_inventory_cache(&self, device: &Device, report: &SyncReport, now: DateTime<Utc>) {
        if device.is_inventory_cache_valid(now) {
            return;
        }
        if let Err(e) = self
            .devices
            .store_inventory_cache(device.tenant_id, device.id, &report.ports, now)
            .await
        {
            warn!(error = %e, "failed to refresh inventory cache");
        }
    }

    async fn apply_retention(&self, tenant_id: TenantId, now: DateTime<Utc>, summary: &mut SyncSummary) {
        let Some(retention) = &self.retention else {
            return;
        };
        match retention.prune_once_per_day(tenant_id, now).await {
            Ok(pruned) => summary.retention_pruned = pruned,
            Err(e) => summary.retention_error = Some(e.to_string()),
        }
    }
}

async fn connect_and_import(
    client: &mut dyn DeviceClient,
    device: &Device,
    state: &mut SyncState,
) -> Result<SyncReport, DeviceClientError> {
    client.connect(device).await?;
    transition(state, SyncState::Connected);
    transition(state, SyncState::Importing);
    client.sync_all_to_local().await
}
