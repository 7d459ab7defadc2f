//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fibernet_core::{DeviceId, TenantId};

/// Handler routing name of [`JobKind::DeviceSync`].
pub const DEVICE_SYNC_KIND: &str = "device.sync";

/// Queue used when a job is not given one explicitly.
pub const DEFAULT_QUEUE: &str = "default";

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job kind, used to route to a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Connect to one OLT and import its state into local storage.
    DeviceSync { device_id: DeviceId },
}

impl JobKind {
    pub fn device_sync(device_id: DeviceId) -> Self {
        Self::DeviceSync { device_id }
    }

    pub fn type_name(&self) -> &str {
        match self {
            JobKind::DeviceSync { .. } => DEVICE_SYNC_KIND,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    Running,
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Out of attempts, moved to the dead-letter queue
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_retriable(&self) -> bool {
        matches!(self, JobStatus::Failed { .. })
    }
}

/// Retry policy: a fixed delay between runs. `max_attempts` counts every
/// run, the first one included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(1, Duration::ZERO)
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// Whether another run is allowed after `attempt` runs.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    /// Named queue; executors may be restricted to one queue.
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Runs so far (starts at 0)
    pub attempt: u32,
    /// Upper bound for a single run; `None` means unbounded.
    pub timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time of the next run (retries, delayed jobs)
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(tenant_id: TenantId, kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            kind,
            queue: DEFAULT_QUEUE.to_string(),
            payload,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            timeout: None,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    /// A device sync job for one device.
    pub fn device_sync(tenant_id: TenantId, device_id: DeviceId) -> Self {
        Self::new(
            tenant_id,
            JobKind::device_sync(device_id),
            serde_json::json!({ "device_id": device_id.get() }),
        )
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_ready(&self) -> bool {
        match self.scheduled_at {
            Some(at) => Utc::now() >= at,
            None => true,
        }
    }

    /// Claimed jobs and jobs still waiting for a run.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Failed { .. }
        )
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Record a failed run and either schedule the retry or dead-letter.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.clone()),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });

        if self.retry_policy.should_retry(self.attempt) {
            let delay = chrono::Duration::from_std(self.retry_policy.delay).unwrap_or_default();
            self.scheduled_at = Some(now + delay);
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }
}

/// What a handler reports back to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Failed; the retry policy decides what happens next.
    Failure(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new(1).unwrap()
    }

    #[test]
    fn max_attempts_counts_the_first_run() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(30));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        assert!(!RetryPolicy::default().should_retry(1));
    }

    #[test]
    fn device_sync_job_routes_by_kind() {
        let job = Job::device_sync(tenant(), DeviceId::new(7).unwrap()).on_queue("device-sync");
        assert_eq!(job.kind.type_name(), DEVICE_SYNC_KIND);
        assert_eq!(job.queue, "device-sync");
        assert_eq!(job.payload["device_id"], 7);
    }

    #[test]
    fn failing_twice_with_two_attempts_dead_letters() {
        let mut job = Job::device_sync(tenant(), DeviceId::new(1).unwrap())
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_secs(30)));

        job.mark_running();
        job.mark_failed("error 1".to_string(), Utc::now());
        assert!(job.status.is_retriable());
        assert!(!job.is_ready());

        job.mark_running();
        job.mark_failed("error 2".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
        assert_eq!(job.history.len(), 2);
    }
}
