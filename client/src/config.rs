//! Configuration for the sync runtime.

use fieldsync_engine::{ClientErrorPolicy, RetryPolicy, DEFAULT_BACKOFF_MS, DEFAULT_MAX_RETRIES};
use std::env;

/// Default number of requests in flight during one drain batch.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Sync runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Attempts before an operation is marked failed
    pub max_retries: u32,
    /// Maximum simultaneous in-flight requests per drain batch
    pub batch_size: usize,
    /// Backoff delays in milliseconds, indexed by retry count
    pub backoff_ms: Vec<u64>,
    /// Whether non-conflict 4xx responses consume the retry budget
    pub client_errors: ClientErrorPolicy,
    /// Base URL relative endpoints are resolved against
    pub base_url: Option<String>,
    /// Whether an offline -> online edge triggers a drain
    pub reconnect_drain: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            batch_size: DEFAULT_BATCH_SIZE,
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            client_errors: ClientErrorPolicy::Retry,
            base_url: None,
            reconnect_drain: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from the environment (and a `.env` file if present).
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("FIELDSYNC_MAX_RETRIES") {
            config.max_retries = parse_number("FIELDSYNC_MAX_RETRIES", &value)?;
        }

        if let Some(value) = lookup("FIELDSYNC_BATCH_SIZE") {
            config.batch_size = parse_number("FIELDSYNC_BATCH_SIZE", &value)?;
        }

        if let Some(value) = lookup("FIELDSYNC_BACKOFF_MS") {
            config.backoff_ms = value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| parse_number("FIELDSYNC_BACKOFF_MS", part))
                .collect::<Result<_, _>>()?;
        }

        if let Some(value) = lookup("FIELDSYNC_CLIENT_ERRORS") {
            config.client_errors = match value.trim() {
                "retry" => ClientErrorPolicy::Retry,
                "fail_fast" => ClientErrorPolicy::FailFast,
                other => return Err(ConfigError::InvalidClientErrors(other.to_string())),
            };
        }

        config.base_url = lookup("FIELDSYNC_BASE_URL").filter(|url| !url.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroMaxRetries);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.backoff_ms.is_empty() {
            return Err(ConfigError::EmptyBackoff);
        }
        Ok(())
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_backoff(self.backoff_ms.clone())
            .with_client_errors(self.client_errors)
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("FIELDSYNC_CLIENT_ERRORS must be 'retry' or 'fail_fast', got '{0}'")]
    InvalidClientErrors(String),

    #[error("max retries must be at least 1")]
    ZeroMaxRetries,

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("backoff table must not be empty")]
    EmptyBackoff,
}
