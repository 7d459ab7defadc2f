//! Job executor with retry, timeout and bounded concurrency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::store::{ClaimFilter, JobStore};
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Runs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Sleep between claims when nothing is ready
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    /// Time past a job's timeout before the handler is abandoned. Handlers
    /// that enforce the timeout themselves use it to clean up.
    pub timeout_grace: Duration,
    /// Name for logging
    pub name: String,
    pub filter: ClaimFilter,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent: 4,
            timeout_grace: Duration::from_secs(10),
            name: "job-executor".to_string(),
            filter: ClaimFilter::default(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.filter.queue = Some(queue.into());
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to a spawned executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job executor task failed");
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Background job executor.
///
/// Claims jobs from a store, routes them to handlers by kind, bounds each run
/// by the job's timeout (plus a grace period), and applies the job's retry
/// policy. Jobs that run out of attempts are dead-lettered.
pub struct JobExecutor<S: JobStore> {
    store: Arc<S>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    config: JobExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: Arc<S>, config: JobExecutorConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn register_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn get_handler(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind.type_name()).cloned()
    }

    /// Execute one claimed job and persist the result.
    pub async fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let started = Utc::now();

        let Some(handler) = self.get_handler(&job.kind) else {
            let error = format!("no handler for job kind: {:?}", job.kind);
            warn!(job_id = %job.id, error = %error, "no handler for job");
            return self.record_failure(job, error, started);
        };

        let outcome = match job.timeout {
            Some(limit) => match tokio::time::timeout(limit + self.config.timeout_grace, handler.handle(job)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(job_id = %job.id, timeout_secs = limit.as_secs(), "handler abandoned after timeout");
                    JobResult::Failure(format!("timed out after {}s", limit.as_secs()))
                }
            },
            None => handler.handle(job).await,
        };

        match outcome {
            JobResult::Success => {
                job.mark_completed(started);
                self.store.update(job).map_err(|e| e.to_string())?;
                debug!(job_id = %job.id, "job completed");
                Ok(())
            }
            JobResult::Failure(error) => self.record_failure(job, error, started),
        }
    }

    fn record_failure(&self, job: &mut Job, error: String, started: chrono::DateTime<Utc>) -> Result<(), String> {
        job.mark_failed(error.clone(), started);
        self.store.update(job).map_err(|e| e.to_string())?;
        if matches!(job.status, JobStatus::DeadLettered { .. }) {
            warn!(job_id = %job.id, kind = job.kind.type_name(), error = %error, "job dead-lettered");
            self.store
                .dead_letter(job.clone(), error.clone())
                .map_err(|e| e.to_string())?;
        }
        Err(error)
    }

    fn record_stats(&self, job: &Job, result: &Result<(), String>) {
        let mut s = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.jobs_processed += 1;
        match result {
            Ok(()) => s.jobs_succeeded += 1,
            Err(_) => {
                s.jobs_failed += 1;
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    s.jobs_dead_lettered += 1;
                }
            }
        }
    }

    fn adjust_running(&self, delta: isize) {
        let mut s = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.current_running = s.current_running.saturating_add_signed(delta);
    }

    async fn run_claimed(self: Arc<Self>, mut job: Job) {
        debug!(executor = %self.config.name, job_id = %job.id, kind = ?job.kind, "claimed job");
        self.adjust_running(1);
        let result = self.execute_one(&mut job).await;
        self.adjust_running(-1);
        self.record_stats(&job, &result);

        if let Err(e) = result {
            debug!(
                executor = %self.config.name,
                job_id = %job.id,
                error = %e,
                status = ?job.status,
                "job execution failed"
            );
        }
    }

    /// Claim and run jobs until nothing matching the filter is outstanding,
    /// including retries that are still waiting out their delay.
    pub async fn run_until_idle(self: Arc<Self>) -> ExecutorStats {
        let (_tx, rx) = watch::channel(false);
        self.clone().drive(rx, true).await;
        self.stats()
    }

    /// Run on the current runtime until the handle is shut down.
    pub fn spawn(self) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let executor = Arc::new(self);
        let join = tokio::spawn(executor.drive(shutdown_rx, false));

        JobExecutorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn drive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, stop_when_idle: bool) {
        info!(executor = %self.config.name, "job executor started");
        let start_time = Instant::now();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            {
                let mut s = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.uptime_secs = start_time.elapsed().as_secs();
            }

            // Reap finished tasks so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}

            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            match self.store.claim_next(&self.config.filter) {
                Ok(Some(job)) => {
                    let executor = self.clone();
                    in_flight.spawn(async move {
                        executor.run_claimed(job).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    if stop_when_idle && in_flight.is_empty() {
                        match self.store.has_outstanding(&self.config.filter) {
                            Ok(false) => break,
                            Ok(true) => {}
                            Err(e) => {
                                error!(executor = %self.config.name, error = %e, "failed to inspect queue");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(executor = %self.config.name, error = %e, "failed to claim job");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!(executor = %self.config.name, "job executor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fibernet_core::{DeviceId, TenantId};

    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{DEVICE_SYNC_KIND, RetryPolicy};

    struct Fixed(JobResult);

    #[async_trait]
    impl JobHandler for Fixed {
        async fn handle(&self, _job: &Job) -> JobResult {
            self.0.clone()
        }
    }

    /// Fails the first `fail_times` runs, then succeeds.
    struct Flaky {
        fail_times: usize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> JobResult {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.fail_times {
                JobResult::Failure(format!("run {run} failed"))
            } else {
                JobResult::Success
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl JobHandler for Slow {
        async fn handle(&self, _job: &Job) -> JobResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            JobResult::Success
        }
    }

    fn tenant() -> TenantId {
        TenantId::new(1).unwrap()
    }

    fn sync_job(device: u64) -> Job {
        Job::device_sync(tenant(), DeviceId::new(device).unwrap())
    }

    fn executor(store: Arc<InMemoryJobStore>) -> JobExecutor<InMemoryJobStore> {
        JobExecutor::new(
            store,
            JobExecutorConfig::default()
                .with_poll_interval(Duration::from_millis(5))
                .with_timeout_grace(Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let store = InMemoryJobStore::arc();
        let mut executor = executor(store.clone());
        executor.register_handler(DEVICE_SYNC_KIND, Arc::new(Fixed(JobResult::Success)));

        store
            .enqueue(sync_job(1))
            .unwrap();

        let mut claimed = store.claim_next(&ClaimFilter::default()).unwrap().unwrap();
        executor.execute_one(&mut claimed).await.unwrap();
        assert!(matches!(claimed.status, JobStatus::Completed));
    }

    #[tokio::test]
    async fn failing_job_dead_letters_after_max_attempts() {
        let store = InMemoryJobStore::arc();
        let mut executor = executor(store.clone());
        executor.register_handler(DEVICE_SYNC_KIND, Arc::new(Fixed(JobResult::Failure("boom".into()))));

        let job = sync_job(1).with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        let id = store.enqueue(job).unwrap();

        let stats = Arc::new(executor).run_until_idle().await;

        assert_eq!(stats.jobs_processed, 2);
        assert_eq!(stats.jobs_dead_lettered, 1);
        assert!(store.get(tenant(), id).unwrap().is_none());
        assert_eq!(store.stats(tenant()).unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn retry_once_then_succeed() {
        let store = InMemoryJobStore::arc();
        let mut executor = executor(store.clone());
        let flaky = Arc::new(Flaky {
            fail_times: 1,
            runs: AtomicUsize::new(0),
        });
        executor.register_handler(DEVICE_SYNC_KIND, flaky.clone());

        store
            .enqueue(
                sync_job(3)
                    .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(10))),
            )
            .unwrap();

        let stats = Arc::new(executor).run_until_idle().await;

        assert_eq!(flaky.runs.load(Ordering::SeqCst), 2);
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(store.stats(tenant()).unwrap().completed, 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let store = InMemoryJobStore::arc();
        let mut executor = executor(store.clone());
        executor.register_handler(DEVICE_SYNC_KIND, Arc::new(Slow));

        store
            .enqueue(
                sync_job(1).with_timeout(Duration::from_millis(20)),
            )
            .unwrap();

        let mut claimed = store.claim_next(&ClaimFilter::default()).unwrap().unwrap();
        let err = executor.execute_one(&mut claimed).await.unwrap_err();
        assert!(err.contains("timed out"));
        assert!(matches!(claimed.status, JobStatus::DeadLettered { .. }));
    }

    #[tokio::test]
    async fn job_without_a_handler_fails() {
        let store = InMemoryJobStore::arc();
        let executor = executor(store.clone());

        store.enqueue(sync_job(1)).unwrap();
        let mut claimed = store.claim_next(&ClaimFilter::default()).unwrap().unwrap();
        let err = executor.execute_one(&mut claimed).await.unwrap_err();
        assert!(err.contains("no handler"));
        assert!(matches!(claimed.status, JobStatus::DeadLettered { .. }));
    }

    #[tokio::test]
    async fn spawned_executor_drains_queue_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let mut executor = executor(store.clone());
        executor.register_handler(DEVICE_SYNC_KIND, Arc::new(Fixed(JobResult::Success)));
        for _ in 0..5 {
            store
                .enqueue(sync_job(1))
                .unwrap();
        }

        let handle = executor.spawn();
        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().jobs_succeeded, 5);
        handle.shutdown().await;
    }
}
