//! `fibernet` command line.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use fibernet_core::{DeviceId, TenantId};
use fibernet_infra::cron_log::CronRun;
use fibernet_infra::devices::DeviceFilter;
use fibernet_infra::jobs::{ExecutorStats, JobStore};

use crate::app::services::AppServices;
use crate::scheduler::DAILY_SYNC_JOB_KEY;

const QUEUE_COMMAND: &str = "fibernet queue-daily-sync";

#[derive(Debug, Parser)]
#[command(name = "fibernet", version, about = "Tenant-scoped daily OLT device sync")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API, the job executor and the scheduled fallback (default).
    Serve,
    /// Enqueue a sync for every matching active device and run them to completion.
    QueueDailySync(QueueDailySyncArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct QueueDailySyncArgs {
    /// Only devices of this tenant.
    #[arg(long)]
    pub tenant: Option<u64>,
    /// Only this device.
    #[arg(long)]
    pub device: Option<u64>,
    /// Queue to enqueue on and drain (defaults to SYNC_QUEUE).
    #[arg(long)]
    pub queue: Option<String>,
}

impl QueueDailySyncArgs {
    pub fn filter(&self) -> anyhow::Result<DeviceFilter> {
        Ok(DeviceFilter {
            tenant_id: self
                .tenant
                .map(TenantId::new)
                .transpose()
                .context("invalid --tenant")?,
            device_id: self
                .device
                .map(DeviceId::new)
                .transpose()
                .context("invalid --device")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantRunReport {
    pub enqueued: usize,
    pub completed: usize,
    pub failed: usize,
    pub status: &'static str,
}

impl TenantRunReport {
    fn new(enqueued: usize, completed: usize, failed: usize) -> Self {
        let status = match failed {
            0 => "success",
            f if f < enqueued => "partial",
            _ => "failed",
        };
        Self {
            enqueued,
            completed,
            failed,
            status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueDailySyncReport {
    pub queue: String,
    pub tenants: BTreeMap<TenantId, TenantRunReport>,
    pub executor: Option<ExecutorStats>,
}

/// Enqueue forced sync jobs (today's markers are ignored), drain the queue in
/// this process, and record one cron run per tenant.
pub async fn queue_daily_sync(
    services: &AppServices,
    args: &QueueDailySyncArgs,
) -> anyhow::Result<QueueDailySyncReport> {
    let filter = args.filter()?;
    let queue = args
        .queue
        .clone()
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| services.config.queue.clone());

    let started_at = Utc::now();
    let enqueued = services
        .dispatcher_for_queue(&queue)
        .dispatch_all(filter)
        .await
        .context("failed to enqueue device sync jobs")?;

    if enqueued.is_empty() {
        info!(?filter, "no active devices matched");
        if let Some(tenant_id) = filter.tenant_id {
            record_run(
                services,
                tenant_id,
                "skipped",
                "no active devices matched".to_string(),
                serde_json::json!({ "queue": queue, "device_id": filter.device_id }),
                started_at,
            )
            .await;
        }
        return Ok(QueueDailySyncReport {
            queue,
            tenants: BTreeMap::new(),
            executor: None,
        });
    }

    let executor = Arc::new(services.executor(&queue));
    let stats = executor.run_until_idle().await;

    let mut tenants = BTreeMap::new();
    for (tenant_id, count) in enqueued {
        let job_stats = services.jobs.stats(tenant_id)?;
        let report = TenantRunReport::new(count, job_stats.completed, job_stats.dead_lettered);

        record_run(
            services,
            tenant_id,
            report.status,
            format!(
                "{} of {} device sync job(s) completed",
                report.completed, report.enqueued
            ),
            serde_json::json!({
                "queue": queue,
                "device_id": filter.device_id,
                "enqueued": report.enqueued,
                "completed": report.completed,
                "failed": report.failed,
            }),
            started_at,
        )
        .await;
        tenants.insert(tenant_id, report);
    }

    info!(queue = %queue, tenants = tenants.len(), "queue-daily-sync finished");
    Ok(QueueDailySyncReport {
        queue,
        tenants,
        executor: Some(stats),
    })
}

async fn record_run(
    services: &AppServices,
    tenant_id: TenantId,
    status: &str,
    message: String,
    meta: serde_json::Value,
    started_at: chrono::DateTime<Utc>,
) {
    services
        .cron
        .record(CronRun {
            tenant_id: tenant_id.get(),
            job_key: DAILY_SYNC_JOB_KEY.to_string(),
            command: QUEUE_COMMAND.to_string(),
            status: status.to_string(),
            message,
            meta,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use clap::CommandFactory;

    use fibernet_infra::config::SyncConfig;
    use fibernet_infra::cron_log::InMemoryCronRunStore;
    use fibernet_infra::device_client::{DeviceClient, DeviceClientError, DeviceClientFactory, SyncReport};
    use fibernet_infra::devices::{Device, InMemoryDeviceRepository};

    use crate::app::services::Backends;

    /// Connects to everything except `unreachable`, imports five units.
    struct FixedClients {
        unreachable: Option<DeviceId>,
    }

    struct FixedClient {
        unreachable: Option<DeviceId>,
    }

    #[async_trait]
    impl DeviceClient for FixedClient {
        fn suppress_interactive_logging(&mut self, _suppress: bool) {}

        async fn connect(&mut self, device: &Device) -> Result<(), DeviceClientError> {
            if Some(device.id) == self.unreachable {
                return Err(DeviceClientError::Network("connection refused".to_string()));
            }
            Ok(())
        }

        async fn sync_all_to_local(&mut self) -> Result<SyncReport, DeviceClientError> {
            Ok(SyncReport {
                synced_count: 5,
                ..SyncReport::default()
            })
        }

        async fn disconnect(&mut self) -> Result<(), DeviceClientError> {
            Ok(())
        }
    }

    impl DeviceClientFactory for FixedClients {
        fn create(&self, _tenant_id: TenantId) -> Box<dyn DeviceClient> {
            Box::new(FixedClient {
                unreachable: self.unreachable,
            })
        }
    }

    fn tenant(n: u64) -> TenantId {
        TenantId::new(n).unwrap()
    }

    fn device(t: u64, d: u64) -> Device {
        Device::new(tenant(t), DeviceId::new(d).unwrap(), format!("olt-{d}"), "10.0.0.1").unwrap()
    }

    async fn services(cron: Arc<InMemoryCronRunStore>) -> AppServices {
        let devices = Arc::new(InMemoryDeviceRepository::with_devices([
            device(1, 1),
            device(1, 2),
            device(2, 3),
        ]));
        let backends = Backends {
            cron_runs: cron,
            ..Backends::in_memory(
                devices,
                Arc::new(FixedClients {
                    unreachable: Some(DeviceId::new(2).unwrap()),
                }),
            )
        };
        let config = SyncConfig {
            max_attempts: 1,
            ..SyncConfig::default()
        };
        AppServices::new(config, backends).await
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["fibernet", "queue-daily-sync", "--tenant", "4", "--queue", "olt"]);
        match cli.command {
            Some(Command::QueueDailySync(args)) => {
                assert_eq!(args.tenant, Some(4));
                assert_eq!(args.device, None);
                assert_eq!(args.queue.as_deref(), Some("olt"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn zero_ids_are_rejected() {
        let args = QueueDailySyncArgs {
            tenant: Some(0),
            ..Default::default()
        };
        assert!(args.filter().is_err());
    }

    #[test]
    fn tenant_status_reflects_failures() {
        assert_eq!(TenantRunReport::new(3, 3, 0).status, "success");
        assert_eq!(TenantRunReport::new(3, 2, 1).status, "partial");
        assert_eq!(TenantRunReport::new(2, 0, 2).status, "failed");
    }

    #[tokio::test]
    async fn runs_every_device_and_records_per_tenant() {
        let cron = Arc::new(InMemoryCronRunStore::new());
        let services = services(cron.clone()).await;

        let report = queue_daily_sync(&services, &QueueDailySyncArgs::default())
            .await
            .unwrap();

        assert_eq!(report.queue, "device-sync");
        assert_eq!(report.tenants[&tenant(1)], TenantRunReport::new(2, 1, 1));
        assert_eq!(report.tenants[&tenant(2)], TenantRunReport::new(1, 1, 0));

        let records = cron.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.job_key == DAILY_SYNC_JOB_KEY));
        let statuses: Vec<_> = records.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["partial", "success"]);

        let outcomes = services.outcomes.recent(tenant(1), None, 10).await.unwrap();
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn empty_selection_for_a_tenant_is_recorded_as_skipped() {
        let cron = Arc::new(InMemoryCronRunStore::new());
        let services = services(cron.clone()).await;

        let args = QueueDailySyncArgs {
            tenant: Some(9),
            ..Default::default()
        };
        let report = queue_daily_sync(&services, &args).await.unwrap();

        assert!(report.tenants.is_empty());
        assert!(report.executor.is_none());
        let records = cron.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "skipped");
        assert_eq!(records[0].tenant_id, tenant(9));
    }

    #[tokio::test]
    async fn queue_override_is_used() {
        let cron = Arc::new(InMemoryCronRunStore::new());
        let services = services(cron).await;

        let args = QueueDailySyncArgs {
            device: Some(3),
            queue: Some("manual".to_string()),
            ..Default::default()
        };
        let report = queue_daily_sync(&services, &args).await.unwrap();

        assert_eq!(report.queue, "manual");
        assert_eq!(report.tenants[&tenant(2)], TenantRunReport::new(1, 1, 0));
    }
}
