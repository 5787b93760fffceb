//! Queued change operations.
//!
//! An [`Operation`] is one not-yet-confirmed change request against a remote
//! resource. Its status only moves along the transitions below; anything else
//! is rejected with [`Error::InvalidTransition`].
//!
//! ```text
//! Pending --mark_syncing--> Syncing --record_failure--> Pending | Failed
//!                              |
//!                              +----mark_conflict-----> Conflict --apply_resolution--> Pending
//! Failed --reset_for_retry--> Pending
//! Syncing --requeue--> Pending            (crash recovery)
//! ```
//!
//! A completed operation is deleted by its owner rather than kept with a
//! `Completed` status.

use crate::conflict::ConflictContext;
use crate::error::{Error, Result};
use crate::retry::{ErrorClass, FailureOutcome, RetryPolicy, MAX_RETRIES_EXCEEDED};
use crate::{EntityId, EntityType, OperationId, OperationKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// HTTP method of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Whether operations with this method may be queued. Reads are never queued.
    pub fn is_queueable(self) -> bool {
        !matches!(self, Method::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Parse a persisted method name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for the next drain pass
    Pending,
    /// Currently in flight
    Syncing,
    /// Retry budget exhausted, waiting for manual retry or discard
    Failed,
    /// Server rejected the write on version; waiting for resolution
    Conflict,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 4] = [
        OperationStatus::Pending,
        OperationStatus::Syncing,
        OperationStatus::Failed,
        OperationStatus::Conflict,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Syncing => "syncing",
            OperationStatus::Failed => "failed",
            OperationStatus::Conflict => "conflict",
        }
    }

    /// Parse a persisted status name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OperationStatus::Pending),
            "syncing" => Some(OperationStatus::Syncing),
            "failed" => Some(OperationStatus::Failed),
            "conflict" => Some(OperationStatus::Conflict),
            _ => None,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the local entity an operation writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<EntityType>, entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Key used for the entity in the local record store.
    pub fn key(&self) -> String {
        format!("{}/{}", self.entity_type, self.entity_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A queued change request.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub method: Method,
    pub endpoint: String,
    pub payload: serde_json::Value,
    /// Derived from `kind`, lower drains first
    pub priority: u32,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    pub last_error: Option<String>,
    pub entity: Option<EntityRef>,
    /// Present only while `status == Conflict`
    pub conflict: Option<ConflictContext>,
}

impl Operation {
    /// Create a new pending operation.
    ///
    /// Fails with [`Error::Validation`] for non-queueable methods, an empty
    /// endpoint or a zero retry budget.
    pub fn new(
        id: impl Into<OperationId>,
        kind: OperationKind,
        method: Method,
        endpoint: impl Into<String>,
        payload: serde_json::Value,
        enqueued_at: Timestamp,
        max_retries: u32,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        if !method.is_queueable() {
            return Err(Error::validation(format!("{method} requests cannot be queued")));
        }
        if endpoint.trim().is_empty() {
            return Err(Error::validation("endpoint must not be empty"));
        }
        if max_retries == 0 {
            return Err(Error::validation("max retries must be at least 1"));
        }

        Ok(Self {
            id: id.into(),
            priority: kind.priority(),
            kind,
            method,
            endpoint,
            payload,
            enqueued_at,
            retry_count: 0,
            max_retries,
            status: OperationStatus::Pending,
            last_error: None,
            entity: None,
            conflict: None,
        })
    }

    /// Attach the entity this operation writes.
    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Drain ordering: `(priority, enqueued_at)` ascending, id as final tiebreak.
    pub fn drain_cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.enqueued_at.cmp(&other.enqueued_at))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether no further automatic processing will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Failed | OperationStatus::Conflict
        )
    }

    fn transition_error(&self, to: OperationStatus) -> Error {
        Error::InvalidTransition {
            id: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Pending -> Syncing.
    pub fn mark_syncing(&mut self) -> Result<()> {
        if self.status != OperationStatus::Pending {
            return Err(self.transition_error(OperationStatus::Syncing));
        }
        self.status = OperationStatus::Syncing;
        Ok(())
    }

    /// Syncing -> Pending without consuming retry budget.
    pub fn requeue(&mut self) -> Result<()> {
        if self.status != OperationStatus::Syncing {
            return Err(self.transition_error(OperationStatus::Pending));
        }
        self.status = OperationStatus::Pending;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// `retry_count` always increases. The operation becomes `Failed` once the
    /// count reaches `max_retries`, or immediately when the policy fails this
    /// class fast. Version conflicts must go through [`Operation::mark_conflict`].
    pub fn record_failure(
        &mut self,
        error: &str,
        class: ErrorClass,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        if class.is_conflict() {
            return Err(Error::validation(
                "version conflicts are resolved, not retried",
            ));
        }
        if !matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::Syncing
        ) {
            return Err(self.transition_error(OperationStatus::Failed));
        }

        self.retry_count = self.retry_count.saturating_add(1);

        if policy.fails_fast(class) {
            self.status = OperationStatus::Failed;
            self.last_error = Some(format!("{class}: {error}"));
            return Ok(FailureOutcome::Exhausted);
        }

        if self.retry_count >= self.max_retries {
            self.retry_count = self.max_retries;
            self.status = OperationStatus::Failed;
            self.last_error = Some(MAX_RETRIES_EXCEEDED.to_string());
            return Ok(FailureOutcome::Exhausted);
        }

        let delay_ms = policy.backoff(self.retry_count);
        self.status = OperationStatus::Pending;
        self.last_error = Some(format!(
            "retry {}/{} in {}ms",
            self.retry_count, self.max_retries, delay_ms
        ));
        Ok(FailureOutcome::Retry {
            attempt: self.retry_count,
            delay_ms,
        })
    }

    /// Pending|Syncing -> Conflict, capturing the conflict snapshots.
    pub fn mark_conflict(&mut self, context: ConflictContext) -> Result<()> {
        if !matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::Syncing
        ) {
            return Err(self.transition_error(OperationStatus::Conflict));
        }
        self.status = OperationStatus::Conflict;
        self.last_error = Some(format!(
            "version conflict: local {} vs server {}",
            context.local_version, context.server_version
        ));
        self.conflict = Some(context);
        Ok(())
    }

    /// Conflict -> Pending with the merged payload and a fresh retry budget.
    pub fn apply_resolution(&mut self, merged: serde_json::Value) -> Result<()> {
        if self.status != OperationStatus::Conflict {
            return Err(self.transition_error(OperationStatus::Pending));
        }
        self.payload = merged;
        self.retry_count = 0;
        self.status = OperationStatus::Pending;
        self.last_error = None;
        self.conflict = None;
        Ok(())
    }

    /// Failed -> Pending for a manual retry.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.status != OperationStatus::Failed {
            return Err(self.transition_error(OperationStatus::Pending));
        }
        self.retry_count = 0;
        self.status = OperationStatus::Pending;
        self.last_error = None;
        Ok(())
    }
}

/// Sort operations into drain order.
pub fn sort_for_drain(ops: &mut [Operation]) {
    ops.sort_by(|a, b| a.drain_cmp(b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictContext;
    use crate::retry::ClientErrorPolicy;
    use serde_json::{json, Map};

    fn op(id: &str, kind: OperationKind, enqueued_at: Timestamp) -> Operation {
        Operation::new(
            id,
            kind,
            Method::Patch,
            "/orders/1",
            json!({"status": "done"}),
            enqueued_at,
            3,
        )
        .unwrap()
    }

    fn context() -> ConflictContext {
        ConflictContext::new(Map::new(), 2, Map::new(), 1, 1000)
    }

    #[test]
    fn new_operation_is_pending() {
        let op = op("op-1", OperationKind::Note, 1000);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.priority, 5);
        assert_eq!(op.retry_count, 0);
        assert!(op.last_error.is_none());
    }

    #[test]
    fn get_is_not_queueable() {
        let err = Operation::new(
            "op-1",
            OperationKind::Note,
            Method::Get,
            "/orders/1",
            json!({}),
            0,
            3,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn empty_endpoint_rejected() {
        let err = Operation::new(
            "op-1",
            OperationKind::Note,
            Method::Post,
            "  ",
            json!({}),
            0,
            3,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn drain_order_priority_then_time() {
        let mut ops = vec![
            op("note", OperationKind::Note, 1),
            op("completion", OperationKind::Completion, 2),
            op("status", OperationKind::StatusChange, 3),
            op("completion-late", OperationKind::Completion, 10),
        ];
        sort_for_drain(&mut ops);
        let ids: Vec<_> = ops.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["completion", "completion-late", "status", "note"]);
    }

    #[test]
    fn retries_until_exhausted() {
        let policy = RetryPolicy::default();
        let mut op = op("op-1", OperationKind::Note, 0);

        op.mark_syncing().unwrap();
        let first = op
            .record_failure("timeout", ErrorClass::NetworkUnreachable, &policy)
            .unwrap();
        assert_eq!(
            first,
            FailureOutcome::Retry {
                attempt: 1,
                delay_ms: 1_000
            }
        );
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.last_error.as_deref(), Some("retry 1/3 in 1000ms"));

        op.mark_syncing().unwrap();
        let second = op
            .record_failure("503", ErrorClass::Server, &policy)
            .unwrap();
        assert_eq!(
            second,
            FailureOutcome::Retry {
                attempt: 2,
                delay_ms: 5_000
            }
        );

        op.mark_syncing().unwrap();
        let third = op
            .record_failure("503", ErrorClass::Server, &policy)
            .unwrap();
        assert_eq!(third, FailureOutcome::Exhausted);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 3);
        assert_eq!(op.last_error.as_deref(), Some(MAX_RETRIES_EXCEEDED));

        // Failed is terminal for automatic processing
        assert!(op.mark_syncing().is_err());
        assert!(op
            .record_failure("503", ErrorClass::Server, &policy)
            .is_err());
    }

    #[test]
    fn client_error_fail_fast() {
        let policy = RetryPolicy::default().with_client_errors(ClientErrorPolicy::FailFast);
        let mut op = op("op-1", OperationKind::Note, 0);
        op.mark_syncing().unwrap();

        let outcome = op
            .record_failure("422 unprocessable", ErrorClass::Client, &policy)
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 1);
        assert_eq!(
            op.last_error.as_deref(),
            Some("client error: 422 unprocessable")
        );
    }

    #[test]
    fn conflict_class_is_rejected_by_record_failure() {
        let mut op = op("op-1", OperationKind::Note, 0);
        let err = op
            .record_failure("409", ErrorClass::VersionConflict, &RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(op.retry_count, 0);
    }

    #[test]
    fn conflict_then_resolution() {
        let mut op = op("op-1", OperationKind::StatusChange, 0);
        op.mark_syncing().unwrap();
        op.record_failure("503", ErrorClass::Server, &RetryPolicy::default())
            .unwrap();
        op.mark_syncing().unwrap();
        op.mark_conflict(context()).unwrap();

        assert_eq!(op.status, OperationStatus::Conflict);
        assert!(op.conflict.is_some());
        assert!(op.mark_syncing().is_err());

        op.apply_resolution(json!({"status": "merged", "version": 2}))
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert!(op.conflict.is_none());
        assert_eq!(op.payload["status"], "merged");
    }

    #[test]
    fn apply_resolution_requires_conflict() {
        let mut op = op("op-1", OperationKind::Note, 0);
        let err = op.apply_resolution(json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn reset_failed_for_manual_retry() {
        let policy = RetryPolicy::new(1);
        let mut op = Operation::new(
            "op-1",
            OperationKind::Waste,
            Method::Post,
            "/waste",
            json!({}),
            0,
            1,
        )
        .unwrap();
        op.mark_syncing().unwrap();
        assert_eq!(
            op.record_failure("down", ErrorClass::Server, &policy)
                .unwrap(),
            FailureOutcome::Exhausted
        );

        op.reset_for_retry().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[test]
    fn requeue_interrupted() {
        let mut op = op("op-1", OperationKind::Note, 0);
        assert!(op.requeue().is_err());
        op.mark_syncing().unwrap();
        op.requeue().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[test]
    fn entity_ref_key() {
        let entity = EntityRef::new("work_order", "wo-17");
        assert_eq!(entity.key(), "work_order/wo-17");
    }

    #[test]
    fn method_names() {
        for method in [
            Method::Get,
            Method::Post,
            Method::Put,
            Method::Patch,
            Method::Delete,
        ] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("TRACE"), None);
    }
}
