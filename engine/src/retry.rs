//! Retry policy, backoff table and failure classification.
//!
//! Failures are classified by [`ErrorClass`]. Network and server failures are
//! retryable with table-driven backoff; a version conflict is never retried.
//! Whether other client errors (4xx) are retried is a policy choice
//! ([`ClientErrorPolicy`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of attempts before an operation is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default backoff table in milliseconds, indexed by `retry_count - 1`.
pub const DEFAULT_BACKOFF_MS: [u64; 5] = [1_000, 5_000, 15_000, 60_000, 300_000];

/// `lastError` recorded when the retry budget is exhausted.
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport could not reach the server (includes timeouts)
    NetworkUnreachable,
    /// 5xx response
    Server,
    /// 409 response: optimistic concurrency check failed
    VersionConflict,
    /// Any other 4xx response
    Client,
}

impl ErrorClass {
    /// Classify an HTTP status code. Returns `None` for success (2xx).
    ///
    /// Informational and redirect codes that reach the engine are treated as
    /// server-side faults.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            409 => Some(ErrorClass::VersionConflict),
            400..=499 => Some(ErrorClass::Client),
            _ => Some(ErrorClass::Server),
        }
    }

    /// Whether this class is routed to conflict handling instead of retry.
    pub fn is_conflict(self) -> bool {
        matches!(self, ErrorClass::VersionConflict)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::NetworkUnreachable => "network unreachable",
            ErrorClass::Server => "server error",
            ErrorClass::VersionConflict => "version conflict",
            ErrorClass::Client => "client error",
        };
        f.write_str(s)
    }
}

/// What to do with non-conflict 4xx responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientErrorPolicy {
    /// Consume the retry budget like a transient failure
    #[default]
    Retry,
    /// Mark the operation failed on the first 4xx
    FailFast,
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Operation is pending again and should be re-drained after `delay_ms`.
    Retry { attempt: u32, delay_ms: u64 },
    /// Operation is terminally failed; no further automatic attempts.
    Exhausted,
}

/// Bounded retry with a clamped backoff table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts before an operation becomes `Failed`
    pub max_retries: u32,
    /// Backoff delays in milliseconds
    pub backoff_ms: Vec<u64>,
    /// Handling of non-conflict 4xx responses
    pub client_errors: ClientErrorPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            client_errors: ClientErrorPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default backoff table.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Replace the backoff table.
    pub fn with_backoff(mut self, backoff_ms: Vec<u64>) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Set the client error policy.
    pub fn with_client_errors(mut self, policy: ClientErrorPolicy) -> Self {
        self.client_errors = policy;
        self
    }

    /// Delay before the next attempt, given the retry count *after* the failure.
    ///
    /// Indexed by `retry_count - 1` and clamped to the last entry. An empty
    /// table means no delay.
    pub fn backoff(&self, retry_count: u32) -> u64 {
        if self.backoff_ms.is_empty() {
            return 0;
        }
        let index = (retry_count.max(1) - 1) as usize;
        let index = index.min(self.backoff_ms.len() - 1);
        self.backoff_ms[index]
    }

    /// Whether a failure of this class should skip the retry budget.
    pub fn fails_fast(&self, class: ErrorClass) -> bool {
        class == ErrorClass::Client && self.client_errors == ClientErrorPolicy::FailFast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_table() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.backoff(n)).collect();
        assert_eq!(delays, vec![1_000, 5_000, 15_000, 60_000, 300_000]);
    }

    #[test]
    fn backoff_is_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(10), 300_000);
        assert_eq!(policy.backoff(u32::MAX), 300_000);
    }

    #[test]
    fn backoff_zero_count_uses_first_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), 1_000);
    }

    #[test]
    fn empty_table_has_no_delay() {
        let policy = RetryPolicy::new(3).with_backoff(Vec::new());
        assert_eq!(policy.backoff(2), 0);
    }

    #[test]
    fn classify_status() {
        assert_eq!(ErrorClass::from_status(200), None);
        assert_eq!(ErrorClass::from_status(204), None);
        assert_eq!(
            ErrorClass::from_status(409),
            Some(ErrorClass::VersionConflict)
        );
        assert_eq!(ErrorClass::from_status(422), Some(ErrorClass::Client));
        assert_eq!(ErrorClass::from_status(503), Some(ErrorClass::Server));
        assert_eq!(ErrorClass::from_status(302), Some(ErrorClass::Server));
    }

    #[test]
    fn fail_fast_only_for_client_errors() {
        let policy = RetryPolicy::default().with_client_errors(ClientErrorPolicy::FailFast);
        assert!(policy.fails_fast(ErrorClass::Client));
        assert!(!policy.fails_fast(ErrorClass::Server));
        assert!(!policy.fails_fast(ErrorClass::NetworkUnreachable));

        let retrying = RetryPolicy::default();
        assert!(!retrying.fails_fast(ErrorClass::Client));
    }
}
