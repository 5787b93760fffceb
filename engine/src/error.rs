//! Error types for the fieldsync engine.

use crate::{OperationId, Version};
use thiserror::Error;

/// All possible errors from the fieldsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Caller errors, surfaced immediately and never enqueued
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    // Persisted state errors
    #[error("corrupt queue record {id}: {reason}")]
    QueueCorruption { id: String, reason: String },

    // State machine errors
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("field '{0}' is not part of the conflict")]
    UnknownConflictField(String),

    #[error("version regression: current {current}, proposed {proposed}")]
    VersionRegression { current: Version, proposed: Version },
}

impl Error {
    /// Shorthand for a [`Error::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Shorthand for a [`Error::QueueCorruption`] error.
    pub fn corruption(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::QueueCorruption {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
