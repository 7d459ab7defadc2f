//! Scheduled fallback: run the daily gate for every tenant at a fixed local
//! time, so devices still sync when nobody logs in.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveTime, Timelike, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use fibernet_core::TenantId;
use fibernet_infra::cron_log::CronRun;
use fibernet_infra::devices::DeviceFilter;

use crate::app::services::AppServices;

pub const DAILY_SYNC_JOB_KEY: &str = "device_daily_sync";
const SCHEDULE_COMMAND: &str = "schedule:device-daily-sync";

/// Six-field cron expression (seconds first) firing daily at `local` in the
/// given offset, expressed in UTC.
pub fn cron_expression(local: NaiveTime, offset: FixedOffset) -> String {
    let local_minutes = i64::from(local.hour() * 60 + local.minute());
    let offset_minutes = i64::from(offset.local_minus_utc() / 60);
    let utc_minutes = (local_minutes - offset_minutes).rem_euclid(24 * 60);
    format!("0 {} {} * * *", utc_minutes % 60, utc_minutes / 60)
}

/// One scheduler tick. Returns the tenants the gate ran for.
pub async fn run_daily_sync_tick(services: &AppServices) -> Vec<TenantId> {
    let devices = match services.devices.list_active_matching(DeviceFilter::default()).await {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "scheduled sync: listing devices failed");
            return Vec::new();
        }
    };
    let tenants: BTreeSet<TenantId> = devices.iter().map(|d| d.tenant_id).collect();

    for tenant_id in &tenants {
        let started_at = Utc::now();
        let result = services
            .dispatcher
            .dispatch_for_tenant_once_per_day(*tenant_id)
            .await;

        let (status, message, enqueued) = match &result {
            Ok(0) => ("skipped", "already dispatched today".to_string(), 0),
            Ok(n) => ("success", format!("enqueued {n} device sync job(s)"), *n),
            Err(e) => ("failed", e.to_string(), 0),
        };

        services
            .cron
            .record(CronRun {
                tenant_id: tenant_id.get(),
                job_key: DAILY_SYNC_JOB_KEY.to_string(),
                command: SCHEDULE_COMMAND.to_string(),
                status: status.to_string(),
                message,
                meta: serde_json::json!({
                    "queue": services.dispatcher.settings().queue,
                    "enqueued": enqueued,
                }),
                started_at: Some(started_at),
                finished_at: Some(Utc::now()),
            })
            .await;
    }

    info!(tenants = tenants.len(), "scheduled daily sync tick finished");
    tenants.into_iter().collect()
}

/// Start the cron scheduler when enabled. The returned scheduler must be
/// kept alive (and shut down) by the caller.
pub async fn start(services: Arc<AppServices>) -> anyhow::Result<Option<JobScheduler>> {
    if !services.config.schedule_enabled {
        return Ok(None);
    }

    let expr = cron_expression(services.config.schedule_time, services.config.utc_offset);
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(expr.as_str(), move |_uuid, _l| {
        let services = services.clone();
        Box::pin(async move {
            run_daily_sync_tick(&services).await;
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    info!(cron = %expr, "scheduled daily sync enabled");
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;

    use fibernet_core::DeviceId;
    use fibernet_infra::config::SyncConfig;
    use fibernet_infra::cron_log::InMemoryCronRunStore;
    use fibernet_infra::device_client::HttpDeviceClientFactory;
    use fibernet_infra::devices::{Device, InMemoryDeviceRepository};
    use fibernet_infra::jobs::{ClaimFilter, JobStore};

    use crate::app::services::Backends;

    #[test]
    fn cron_expression_converts_local_time_to_utc() {
        let at = NaiveTime::from_hms_opt(2, 15, 0).unwrap();

        assert_eq!(cron_expression(at, FixedOffset::east_opt(0).unwrap()), "0 15 2 * * *");
        assert_eq!(cron_expression(at, FixedOffset::east_opt(7 * 3600).unwrap()), "0 15 19 * * *");
        assert_eq!(
            cron_expression(at, FixedOffset::west_opt(5 * 3600 + 30 * 60).unwrap()),
            "0 45 7 * * *"
        );
    }

    fn device(t: u64, d: u64) -> Device {
        Device::new(TenantId::new(t).unwrap(), DeviceId::new(d).unwrap(), format!("olt-{d}"), "10.0.0.1").unwrap()
    }

    #[tokio::test]
    async fn tick_runs_the_gate_per_tenant_and_records_runs() {
        let devices = Arc::new(InMemoryDeviceRepository::with_devices([
            device(1, 1),
            device(1, 2),
            device(2, 3),
            device(3, 4).inactive(),
        ]));
        let cron_store = Arc::new(InMemoryCronRunStore::new());
        let backends = Backends {
            cron_runs: cron_store.clone(),
            ..Backends::in_memory(devices, Arc::new(HttpDeviceClientFactory::new("http://127.0.0.1:9")))
        };
        let services = AppServices::new(SyncConfig::default(), backends).await;

        let tenants = run_daily_sync_tick(&services).await;
        assert_eq!(tenants, vec![TenantId::new(1).unwrap(), TenantId::new(2).unwrap()]);
        assert!(services.jobs.has_outstanding(&ClaimFilter::queue("device-sync")).unwrap());

        let records = cron_store.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.job_key == DAILY_SYNC_JOB_KEY && r.status == "success"));

        // Second tick the same day enqueues nothing.
        run_daily_sync_tick(&services).await;
        let records = cron_store.records();
        assert_eq!(records.len(), 4);
        assert!(records[2..].iter().all(|r| r.status == "skipped"));
    }
}
