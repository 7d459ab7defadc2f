//! Runtime configuration, read from the environment.
//!
//! Parsing goes through a lookup closure so tests never touch process env.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the daily device sync subsystem and its hosting process.
#[derive(Clone)]
pub struct SyncConfig {
    pub bind_addr: String,
    pub jwt_secret: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub device_service_url: Option<String>,
    /// Queue name that sync jobs are enqueued on.
    pub queue: String,
    pub on_access_enabled: bool,
    /// Minimum spacing between on-access gate attempts for one tenant.
    pub on_access_min_interval: Duration,
    pub schedule_enabled: bool,
    /// Local wall-clock time of the scheduled fallback.
    pub schedule_time: NaiveTime,
    pub lock_lease: Duration,
    pub job_timeout: Duration,
    /// Total attempts per job (2 = retry once).
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Offset used to decide which calendar day "today" is.
    pub utc_offset: FixedOffset,
    pub signal_retention_days: u32,
    pub executor_concurrency: usize,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("device_service_url", &self.device_service_url)
            .field("queue", &self.queue)
            .field("on_access_enabled", &self.on_access_enabled)
            .field("on_access_min_interval", &self.on_access_min_interval)
            .field("schedule_enabled", &self.schedule_enabled)
            .field("schedule_time", &self.schedule_time)
            .field("lock_lease", &self.lock_lease)
            .field("job_timeout", &self.job_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("utc_offset", &self.utc_offset)
            .field("signal_retention_days", &self.signal_retention_days)
            .field("executor_concurrency", &self.executor_concurrency)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            jwt_secret: None,
            database_url: None,
            redis_url: None,
            device_service_url: None,
            queue: "device-sync".to_string(),
            on_access_enabled: true,
            on_access_min_interval: Duration::from_secs(300),
            schedule_enabled: false,
            schedule_time: NaiveTime::from_hms_opt(2, 15, 0).unwrap_or_default(),
            lock_lease: Duration::from_secs(7500),
            job_timeout: Duration::from_secs(7200),
            max_attempts: 2,
            retry_delay: Duration::from_secs(30),
            utc_offset: Utc.fix(),
            signal_retention_days: 90,
            executor_concurrency: 4,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let offset_minutes = parse_or(&lookup, "SYNC_UTC_OFFSET_MINUTES", 0i32)?;
        let utc_offset = FixedOffset::east_opt(offset_minutes.saturating_mul(60)).ok_or(
            ConfigError::InvalidValue {
                key: "SYNC_UTC_OFFSET_MINUTES",
                reason: format!("{offset_minutes} is out of range"),
            },
        )?;

        let schedule_time = match optional_trimmed(&lookup, "SYNC_SCHEDULE_TIME") {
            Some(raw) => NaiveTime::parse_from_str(&raw, "%H:%M").map_err(|e| {
                ConfigError::InvalidValue {
                    key: "SYNC_SCHEDULE_TIME",
                    reason: format!("expected HH:MM ({e})"),
                }
            })?,
            None => defaults.schedule_time,
        };

        let config = Self {
            bind_addr: optional_trimmed(&lookup, "BIND_ADDR").unwrap_or(defaults.bind_addr),
            jwt_secret: optional_trimmed(&lookup, "JWT_SECRET"),
            database_url: optional_trimmed(&lookup, "DATABASE_URL"),
            redis_url: optional_trimmed(&lookup, "REDIS_URL"),
            device_service_url: optional_trimmed(&lookup, "DEVICE_SERVICE_URL"),
            queue: optional_trimmed(&lookup, "SYNC_QUEUE").unwrap_or(defaults.queue),
            on_access_enabled: parse_bool(&lookup, "SYNC_ON_ACCESS", defaults.on_access_enabled)?,
            on_access_min_interval: Duration::from_secs(parse_or(
                &lookup,
                "SYNC_ON_ACCESS_MIN_INTERVAL_SECS",
                defaults.on_access_min_interval.as_secs(),
            )?),
            schedule_enabled: parse_bool(&lookup, "SYNC_SCHEDULE_ENABLED", defaults.schedule_enabled)?,
            schedule_time,
            lock_lease: Duration::from_secs(parse_or(
                &lookup,
                "SYNC_LOCK_LEASE_SECS",
                defaults.lock_lease.as_secs(),
            )?),
            job_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SYNC_JOB_TIMEOUT_SECS",
                defaults.job_timeout.as_secs(),
            )?),
            max_attempts: parse_or(&lookup, "SYNC_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_delay: Duration::from_secs(parse_or(
                &lookup,
                "SYNC_RETRY_DELAY_SECS",
                defaults.retry_delay.as_secs(),
            )?),
            utc_offset,
            signal_retention_days: parse_or(
                &lookup,
                "SIGNAL_HISTORY_RETENTION_DAYS",
                defaults.signal_retention_days,
            )?,
            executor_concurrency: parse_or(
                &lookup,
                "SYNC_EXECUTOR_CONCURRENCY",
                defaults.executor_concurrency,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks.
    ///
    /// The lock lease must outlive the job timeout, otherwise a slow but still
    /// running sync could lose its lease to a second run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_lease <= self.job_timeout {
            return Err(ConfigError::Invalid(format!(
                "SYNC_LOCK_LEASE_SECS ({}) must exceed SYNC_JOB_TIMEOUT_SECS ({})",
                self.lock_lease.as_secs(),
                self.job_timeout.as_secs()
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("SYNC_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if self.executor_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "SYNC_EXECUTOR_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.queue.is_empty() {
            return Err(ConfigError::Invalid("SYNC_QUEUE must not be empty".to_string()));
        }
        Ok(())
    }

    /// Margin between lease expiry and the job timeout.
    pub fn lease_margin(&self) -> Duration {
        self.lock_lease.saturating_sub(self.job_timeout)
    }
}

fn optional_trimmed(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match optional_trimmed(lookup, key) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match optional_trimmed(lookup, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key,
                reason: format!("'{other}' is not a boolean"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();

        assert!(config.on_access_enabled);
        assert!(!config.schedule_enabled);
        assert_eq!(config.schedule_time, NaiveTime::from_hms_opt(2, 15, 0).unwrap());
        assert_eq!(config.lock_lease, Duration::from_secs(7500));
        assert_eq!(config.job_timeout, Duration::from_secs(7200));
        assert_eq!(config.lease_margin(), Duration::from_secs(300));
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.queue, "device-sync");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SYNC_ON_ACCESS", "off"),
            ("SYNC_SCHEDULE_ENABLED", "TRUE"),
            ("SYNC_SCHEDULE_TIME", "23:05"),
            ("SYNC_UTC_OFFSET_MINUTES", "420"),
            ("SYNC_QUEUE", " olt "),
        ]))
        .unwrap();

        assert!(!config.on_access_enabled);
        assert!(config.schedule_enabled);
        assert_eq!(config.schedule_time, NaiveTime::from_hms_opt(23, 5, 0).unwrap());
        assert_eq!(config.utc_offset.local_minus_utc(), 7 * 3600);
        assert_eq!(config.queue, "olt");
    }

    #[test]
    fn lease_must_exceed_timeout() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("SYNC_LOCK_LEASE_SECS", "600"),
            ("SYNC_JOB_TIMEOUT_SECS", "600"),
        ]))
        .unwrap_err();

        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("SYNC_SCHEDULE_TIME", "2am")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "SYNC_SCHEDULE_TIME", .. }));

        let err = SyncConfig::from_lookup(lookup(&[("SYNC_ON_ACCESS", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "SYNC_ON_ACCESS", .. }));
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = SyncConfig::from_lookup(lookup(&[("JWT_SECRET", "hunter2")])).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
