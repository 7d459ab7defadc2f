//! Infrastructure for daily device sync: configuration, locks, markers,
//! storage adapters, the device client, and the background job system.

pub mod cache;
pub mod config;
pub mod cron_log;
pub mod device_client;
pub mod devices;
pub mod jobs;
pub mod lock;
pub mod outcome_log;
pub mod retention;
pub mod sync;
