//! # Fieldsync Engine
//!
//! Deterministic core of an offline synchronization engine for field-service
//! order management.
//!
//! This crate holds the logic that decides *what* happens to a queued change:
//! in which order operations drain, how failed attempts are retried, when an
//! operation gives up, how version conflicts are captured and merged field by
//! field, and how an optimistic local write is confirmed or rolled back. The
//! async runtime that drives it (durable store, transport, scheduler) lives in
//! `fieldsync-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, network, clocks or logging; callers pass timestamps in
//! - **Deterministic**: same inputs always produce the same outputs
//! - **Explicit state machines**: illegal transitions are errors, not no-ops
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! An [`Operation`] is one queued change request (`POST`/`PUT`/`PATCH`/`DELETE`
//! against an endpoint). Its [`OperationKind`] maps to a static priority; the
//! queue drains by `(priority, enqueued_at)` ascending.
//!
//! ### Retry
//!
//! [`RetryPolicy`] bounds the attempts of an operation and picks the backoff
//! delay from a clamped table (`1s, 5s, 15s, 60s, 300s` by default).
//!
//! ### Conflicts
//!
//! A `409` captures a [`ConflictContext`]. [`Resolution`] holds a per-field
//! choice (server wins by default) and [`apply_resolution`] produces the merged
//! payload stamped with the server version.
//!
//! ### Optimistic writes
//!
//! [`EntityWrite`] applies a patch to a [`VersionedEntity`] while keeping the
//! pre-mutation snapshot for rollback.
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldsync_engine::{
//!     ErrorClass, FailureOutcome, Method, Operation, OperationKind, OperationStatus,
//!     RetryPolicy,
//! };
//! use serde_json::json;
//!
//! let policy = RetryPolicy::new(3);
//! let mut op = Operation::new(
//!     "op_1",
//!     OperationKind::StatusChange,
//!     Method::Patch,
//!     "/work-orders/17",
//!     json!({"status": "en_route", "version": 4}),
//!     1706745600000,
//!     policy.max_retries,
//! )
//! .unwrap();
//!
//! op.mark_syncing().unwrap();
//! let outcome = op
//!     .record_failure("connection reset", ErrorClass::NetworkUnreachable, &policy)
//!     .unwrap();
//!
//! assert_eq!(outcome, FailureOutcome::Retry { attempt: 1, delay_ms: 1_000 });
//! assert_eq!(op.status, OperationStatus::Pending);
//! ```

pub mod clock;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod kind;
pub mod operation;
pub mod record;
pub mod retry;

// Re-export main types at crate root
pub use clock::MonotonicClock;
pub use conflict::{
    apply_resolution, ConflictContext, FieldDiff, Resolution, Side, CRITICAL_FIELDS,
    SYSTEM_FIELDS,
};
pub use entity::{validate_patch, EntityWrite, VersionedEntity, WriteState};
pub use error::Error;
pub use kind::{OperationKind, UNKNOWN_PRIORITY};
pub use operation::{sort_for_drain, EntityRef, Method, Operation, OperationStatus};
pub use record::{decode_operation, encode_operation, OperationRecord};
pub use retry::{
    ClientErrorPolicy, ErrorClass, FailureOutcome, RetryPolicy, DEFAULT_BACKOFF_MS,
    DEFAULT_MAX_RETRIES, MAX_RETRIES_EXCEEDED,
};

/// Type aliases for clarity
pub type OperationId = String;
pub type EntityId = String;
pub type EntityType = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type Fields = serde_json::Map<String, serde_json::Value>;
