//! Runtime configuration read from `WARDSYNC_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::daemon::{DaemonOptions, FlushTimer};
use crate::submission::DEFAULT_REQUEST_TIMEOUT;

pub const BASE_URL: &str = "WARDSYNC_BASE_URL";
pub const TOKEN: &str = "WARDSYNC_TOKEN";
pub const DB_PATH: &str = "WARDSYNC_DB_PATH";
pub const REQUEST_TIMEOUT_MS: &str = "WARDSYNC_REQUEST_TIMEOUT_MS";
pub const RETRY_MAX_ATTEMPTS: &str = "WARDSYNC_RETRY_MAX_ATTEMPTS";
pub const RETRY_MIN_DELAY_MS: &str = "WARDSYNC_RETRY_MIN_DELAY_MS";
pub const RETRY_MAX_DELAY_MS: &str = "WARDSYNC_RETRY_MAX_DELAY_MS";
pub const FLUSH_INTERVAL_MS: &str = "WARDSYNC_FLUSH_INTERVAL_MS";
pub const FLUSH_JITTER_MS: &str = "WARDSYNC_FLUSH_JITTER_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of the outbox process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Endpoint that receives transaction bundles.
    pub base_url: String,
    pub token: Option<String>,
    /// SQLite file; `None` means the per-user data directory.
    pub db_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// `None` disables periodic flushing (`WARDSYNC_FLUSH_INTERVAL_MS=0`).
    pub flush_timer: Option<FlushTimer>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/fhir".to_string(),
            token: None,
            db_path: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffPolicy::default(),
            flush_timer: Some(FlushTimer::default()),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their
    /// defaults and blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get(BASE_URL) {
            config.base_url = url.trim().to_string();
        }
        config.token = get(TOKEN);
        config.db_path = get(DB_PATH).map(PathBuf::from);

        if let Some(ms) = parse::<u64>(&get, REQUEST_TIMEOUT_MS)? {
            if ms == 0 {
                return Err(invalid(REQUEST_TIMEOUT_MS, "0", "timeout must be positive"));
            }
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse::<u32>(&get, RETRY_MAX_ATTEMPTS)? {
            config.backoff.max_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&get, RETRY_MIN_DELAY_MS)? {
            config.backoff.min_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&get, RETRY_MAX_DELAY_MS)? {
            config.backoff.max_delay = Duration::from_millis(ms);
        }

        let interval = parse::<u64>(&get, FLUSH_INTERVAL_MS)?;
        let jitter = parse::<u64>(&get, FLUSH_JITTER_MS)?;
        config.flush_timer = match (interval, config.flush_timer) {
            (Some(0), _) => None,
            (Some(ms), timer) => Some(FlushTimer {
                interval: Duration::from_millis(ms),
                ..timer.unwrap_or_default()
            }),
            (None, timer) => timer,
        };
        if let (Some(ms), Some(timer)) = (jitter, config.flush_timer.as_mut()) {
            timer.jitter = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            flush_on_startup: true,
            timer: self.flush_timer,
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| invalid(var, &raw, err.to_string()))
        })
        .transpose()
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}
