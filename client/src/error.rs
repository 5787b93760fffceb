//! Unified error handling for the sync runtime.
//!
//! Normal retry flow never surfaces here: transport and server failures during
//! a drain are absorbed into queue state. These errors reach callers only for
//! invalid requests, stale immediate writes and store/engine faults.

use fieldsync_engine::{EntityRef, Version};

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("stale write to {entity}: server has moved on")]
    StaleWrite {
        entity: EntityRef,
        /// Server version after refetch, when the refetch succeeded
        server_version: Option<Version>,
    },

    #[error("write to {entity} rejected with status {status}")]
    Rejected { entity: EntityRef, status: u16 },

    #[error("Engine error: {0}")]
    Engine(fieldsync_engine::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<fieldsync_engine::Error> for SyncError {
    fn from(err: fieldsync_engine::Error) -> Self {
        match err {
            fieldsync_engine::Error::Validation(msg) => SyncError::Validation(msg),
            other => SyncError::Engine(other),
        }
    }
}

impl SyncError {
    /// Whether the caller sent something invalid (nothing was enqueued).
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation(_))
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_validation_maps_to_validation() {
        let err: SyncError = fieldsync_engine::Error::validation("patch is empty").into();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "invalid request: patch is empty");
    }

    #[test]
    fn other_engine_errors_are_wrapped() {
        let err: SyncError = fieldsync_engine::Error::OperationNotFound("op-1".into()).into();
        assert!(matches!(
            err,
            SyncError::Engine(fieldsync_engine::Error::OperationNotFound(_))
        ));
    }

    #[test]
    fn stale_write_display() {
        let err = SyncError::StaleWrite {
            entity: EntityRef::new("work_order", "17"),
            server_version: Some(6),
        };
        assert_eq!(
            err.to_string(),
            "stale write to work_order/17: server has moved on"
        );
    }
}
