//! Daily device synchronization: the dispatch gate, the lock-guarded job,
//! and the executor adapter that connects them.

use std::sync::Arc;

use crate::cache::MarkerStore;
use crate::outcome_log::{OutcomeLogStore, OutcomeLogger};
use crate::retention::{SignalHistoryStore, SignalRetention};

pub mod dispatcher;
pub mod handler;
pub mod job;
pub mod period;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{DailySyncDispatcher, DispatchError, DispatchSettings, dispatch_marker_key};
pub use handler::DeviceSyncHandler;
pub use job::{
    DeviceSyncJob, SYNC_ACTION, SYNC_ACTOR, SYNC_MODE, SkipReason, SyncError, SyncRunOutcome, SyncState,
    SyncSummary, sync_lock_key,
};

pub type SharedOutcomeLogger = Arc<OutcomeLogger<Arc<dyn OutcomeLogStore>>>;
pub type SharedRetention = Arc<SignalRetention<Arc<dyn SignalHistoryStore>, Arc<dyn MarkerStore>>>;
