//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use fibernet_core::TenantId;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Which jobs a claim may pick up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    pub tenant_id: Option<TenantId>,
    pub queue: Option<String>,
}

impl ClaimFilter {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            tenant_id: None,
            queue: Some(queue.into()),
        }
    }

    fn matches(&self, job: &Job) -> bool {
        self.tenant_id.is_none_or(|t| job.tenant_id == t)
            && self.queue.as_deref().is_none_or(|q| job.queue == q)
    }
}

pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest ready job matching `filter` and mark it running.
    fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<Job>, JobStoreError>;

    /// Whether any job matching `filter` is pending, running, or awaiting a retry.
    fn has_outstanding(&self, filter: &ClaimFilter) -> Result<bool, JobStoreError>;

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Move a job to the dead-letter queue.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

/// In-memory job store for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every job (not dead-lettered) in creation order.
    pub fn snapshot(&self) -> Vec<Job> {
        let Ok(jobs) = self.jobs.read() else {
            return Vec::new();
        };
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| (j.created_at, j.id.0));
        all
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        match jobs.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;

        // FIFO by creation time; v7 ids break ties.
        let next = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. })
                    && j.is_ready()
                    && filter.matches(j)
            })
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    fn has_outstanding(&self, filter: &ClaimFilter) -> Result<bool, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.values().any(|j| j.is_outstanding() && filter.matches(j)))
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && status.as_ref().is_none_or(|s| {
                        std::mem::discriminant(&j.status) == std::mem::discriminant(s)
                    })
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut dls = self.dead_letters.write().map_err(|_| poisoned())?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));

        Ok(())
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;

        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }

        stats.dead_lettered += dls.values().filter(|e| e.job.tenant_id == tenant_id).count();

        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(tenant_id, job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(filter)
    }

    fn has_outstanding(&self, filter: &ClaimFilter) -> Result<bool, JobStoreError> {
        (**self).has_outstanding(filter)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibernet_core::DeviceId;

    fn tenant(n: u64) -> TenantId {
        TenantId::new(n).unwrap()
    }

    fn job(t: u64) -> Job {
        Job::device_sync(tenant(t), DeviceId::new(1).unwrap())
    }

    #[test]
    fn enqueue_and_claim_fifo() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job(1)).unwrap();
        let second = store.enqueue(job(1)).unwrap();

        let claimed = store.claim_next(&ClaimFilter::default()).unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        let claimed = store.claim_next(&ClaimFilter::default()).unwrap().unwrap();
        assert_eq!(claimed.id, second);

        assert!(store.claim_next(&ClaimFilter::default()).unwrap().is_none());
    }

    #[test]
    fn claim_respects_queue_and_tenant() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(1).on_queue("device-sync")).unwrap();
        store.enqueue(job(2)).unwrap();

        assert!(store.claim_next(&ClaimFilter::queue("other")).unwrap().is_none());

        let only_tenant_two = ClaimFilter {
            tenant_id: Some(tenant(2)),
            queue: None,
        };
        let claimed = store.claim_next(&only_tenant_two).unwrap().unwrap();
        assert_eq!(claimed.tenant_id, tenant(2));

        let claimed = store.claim_next(&ClaimFilter::queue("device-sync")).unwrap().unwrap();
        assert_eq!(claimed.tenant_id, tenant(1));
    }

    #[test]
    fn tenant_isolation_on_get() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(1)).unwrap();

        assert!(matches!(
            store.get(tenant(2), id),
            Err(JobStoreError::TenantIsolation)
        ));
    }

    #[test]
    fn outstanding_until_terminal() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(1)).unwrap();
        let filter = ClaimFilter::default();
        assert!(store.has_outstanding(&filter).unwrap());

        let mut claimed = store.claim_next(&filter).unwrap().unwrap();
        assert!(store.has_outstanding(&filter).unwrap());

        claimed.mark_completed(Utc::now());
        store.update(&claimed).unwrap();
        assert!(!store.has_outstanding(&filter).unwrap());
    }

    #[test]
    fn dead_lettered_jobs_leave_the_queue_but_stay_counted() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(1)).unwrap();

        let claimed = store.claim_next(&ClaimFilter::default()).unwrap().unwrap();
        store.dead_letter(claimed, "boom".to_string()).unwrap();

        assert!(store.get(tenant(1), id).unwrap().is_none());
        assert!(!store.has_outstanding(&ClaimFilter::default()).unwrap());
        assert_eq!(store.stats(tenant(1)).unwrap().dead_lettered, 1);
        assert_eq!(store.stats(tenant(2)).unwrap().dead_lettered, 0);
    }

    #[test]
    fn stats_by_tenant() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.enqueue(job(1)).unwrap();
        }
        store.enqueue(job(2)).unwrap();
        store
            .claim_next(&ClaimFilter {
                tenant_id: Some(tenant(1)),
                queue: None,
            })
            .unwrap();

        let stats = store.stats(tenant(1)).unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
    }
}
