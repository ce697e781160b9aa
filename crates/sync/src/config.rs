//! Engine and daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stockroom_observability::LogFormat;
use thiserror::Error;

use crate::governor::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Tunables of the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the Remote Service (`https://host/api`).
    pub api_url: String,
    /// Bearer token sent with every request, if any.
    pub auth_token: Option<String>,
    /// SQLite file; `None` means [`crate::store::default_db_path`].
    pub db_path: Option<PathBuf>,
    pub sync_interval_secs: u64,
    pub janitor_interval_secs: u64,
    pub max_attempts: u32,
    /// How far back the duplicate guard looks for an already-applied record.
    pub duplicate_window_secs: u64,
    pub request_timeout_secs: u64,
    pub log_format: LogFormat,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api".to_string(),
            auth_token: None,
            db_path: None,
            sync_interval_secs: 30,
            janitor_interval_secs: 300,
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            duplicate_window_secs: 600,
            request_timeout_secs: 15,
            log_format: LogFormat::Json,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `STOCKROOM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(url) = lookup("STOCKROOM_API_URL") {
            cfg.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(token) = lookup("STOCKROOM_AUTH_TOKEN").filter(|t| !t.is_empty()) {
            cfg.auth_token = Some(token);
        }
        if let Some(path) = lookup("STOCKROOM_DB_PATH") {
            cfg.db_path = Some(PathBuf::from(path));
        }
        if let Some(v) = lookup("STOCKROOM_SYNC_INTERVAL_SECS") {
            cfg.sync_interval_secs = parse_secs("STOCKROOM_SYNC_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("STOCKROOM_JANITOR_INTERVAL_SECS") {
            cfg.janitor_interval_secs = parse_secs("STOCKROOM_JANITOR_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("STOCKROOM_DUPLICATE_WINDOW_SECS") {
            cfg.duplicate_window_secs = v.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "STOCKROOM_DUPLICATE_WINDOW_SECS",
                expected: "a number of seconds",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("STOCKROOM_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout_secs = parse_secs("STOCKROOM_REQUEST_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("STOCKROOM_LOG_FORMAT") {
            cfg.log_format = v.parse().map_err(|_| ConfigError::Invalid {
                var: "STOCKROOM_LOG_FORMAT",
                expected: "'json' or 'pretty'",
                value: v.clone(),
            })?;
        }

        Ok(cfg)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn duplicate_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.duplicate_window_secs.min(MAX_WINDOW_SECS) as i64)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }
}

// One year; keeps the window representable as a chrono duration.
const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Positive number of seconds.
fn parse_secs(var: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a positive number of seconds",
            value,
        }),
    }
}
