//! Runtime configuration for the sync layer.
//!
//! `SyncConfig` carries defaults and `with_*` builders for embedding apps, and
//! can also be read from `PETSIT_*` environment variables.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::{is_http_url, is_ws_url};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
const DEFAULT_MAX_POLL_FAILURES: u32 = 5;
const DEFAULT_TOMBSTONE_RETENTION_DAYS: u64 = 30;
const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration shared by the client, transport and maintenance tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Candidate REST base URLs, probed in order
    pub api_base_urls: Vec<String>,
    /// WebSocket push endpoint; polling only when absent
    pub push_url: Option<String>,
    /// Local database file; in-memory when absent
    pub db_path: Option<PathBuf>,
    /// Per-request timeout for REST calls (default: 10 seconds)
    pub request_timeout: Duration,
    /// Fallback polling interval (default: 15 seconds)
    pub poll_interval: Duration,
    /// Consecutive poll failures before polling pauses (default: 5)
    pub max_poll_failures: u32,
    /// Age after which tombstones are purged (default: 30 days)
    pub tombstone_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_urls: Vec::new(),
            push_url: None,
            db_path: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            tombstone_retention: Duration::from_secs(
                DEFAULT_TOMBSTONE_RETENTION_DAYS * SECS_PER_DAY,
            ),
        }
    }
}

impl SyncConfig {
    /// Create a configuration for a single REST base URL
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_urls: vec![api_base_url.into()],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_push_url(mut self, push_url: impl Into<String>) -> Self {
        self.push_url = Some(push_url.into());
        self
    }

    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_max_poll_failures(mut self, failures: u32) -> Self {
        self.max_poll_failures = failures;
        self
    }

    #[must_use]
    pub const fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// Whether a live push endpoint is configured
    pub const fn has_push(&self) -> bool {
        self.push_url.is_some()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_urls = required_trimmed(&lookup, "PETSIT_API_BASE_URL")?;
        let api_base_urls = raw_urls
            .split(',')
            .map(str::trim)
            .filter(|candidate| !candidate.is_empty())
            .map(|candidate| candidate.trim_end_matches('/').to_string())
            .collect::<Vec<_>>();
        if api_base_urls.is_empty() {
            return Err(ConfigError::MissingVar("PETSIT_API_BASE_URL"));
        }
        if let Some(invalid) = api_base_urls.iter().find(|url| !is_http_url(url)) {
            return Err(ConfigError::Invalid(format!(
                "PETSIT_API_BASE_URL entry '{invalid}' must start with http:// or https://"
            )));
        }

        let push_url = optional_trimmed(&lookup, "PETSIT_PUSH_URL");
        if let Some(url) = push_url.as_deref() {
            if !is_ws_url(url) {
                return Err(ConfigError::Invalid(
                    "PETSIT_PUSH_URL must start with ws:// or wss://".to_string(),
                ));
            }
        }

        let db_path = optional_trimmed(&lookup, "PETSIT_DB_PATH").map(PathBuf::from);

        let request_timeout_secs = bounded_u64(
            &lookup,
            "PETSIT_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1..=60,
        )?;
        let poll_interval_secs = bounded_u64(
            &lookup,
            "PETSIT_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
            1..=3_600,
        )?;
        let max_poll_failures = bounded_u64(
            &lookup,
            "PETSIT_MAX_POLL_FAILURES",
            u64::from(DEFAULT_MAX_POLL_FAILURES),
            1..=100,
        )?;
        let retention_days = bounded_u64(
            &lookup,
            "PETSIT_TOMBSTONE_RETENTION_DAYS",
            DEFAULT_TOMBSTONE_RETENTION_DAYS,
            1..=365,
        )?;

        Ok(Self {
            api_base_urls,
            push_url,
            db_path,
            request_timeout: Duration::from_secs(request_timeout_secs),
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_poll_failures: u32::try_from(max_poll_failures).map_err(|_| {
                ConfigError::Invalid("PETSIT_MAX_POLL_FAILURES out of range".to_string())
            })?,
            tombstone_retention: Duration::from_secs(retention_days * SECS_PER_DAY),
        })
    }
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
