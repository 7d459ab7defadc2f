use std::sync::Arc;

use async_trait::async_trait;

use crate::jobs::{Job, JobHandler, JobKind, JobResult};

use super::job::{DeviceSyncJob, SyncRunOutcome};

/// Runs `DeviceSync` jobs. A skipped run (device gone, lock held) is a success
/// so the executor does not retry it.
///
/// The job's timeout is enforced here, around the device session, so a run
/// that overruns still closes the session, logs its outcome and gives the
/// lock back before the executor schedules the retry.
pub struct DeviceSyncHandler {
    job: Arc<DeviceSyncJob>,
}

impl DeviceSyncHandler {
    pub fn new(job: Arc<DeviceSyncJob>) -> Self {
        Self { job }
    }
}

#[async_trait]
impl JobHandler for DeviceSyncHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let JobKind::DeviceSync { device_id } = &job.kind else {
            return JobResult::Failure(format!("unexpected job kind: {}", job.kind.type_name()));
        };

        match self.job.run_within(job.tenant_id, *device_id, job.timeout).await {
            Ok(SyncRunOutcome::Completed(_) | SyncRunOutcome::Skipped(_)) => JobResult::Success,
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}
