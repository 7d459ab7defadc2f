//! Background job system with fixed-delay retries, timeouts and dead-lettering.
//!
//! - Jobs are tenant-scoped, typed, and enqueued on a named queue
//! - `RetryPolicy::max_attempts` counts total runs
//! - Jobs that exhaust their attempts land in the dead-letter queue

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler};
pub use store::{ClaimFilter, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    DEFAULT_QUEUE, DEVICE_SYNC_KIND, DeadLetterEntry, Job, JobId, JobKind, JobResult,
    JobStatus, RetryPolicy,
};
