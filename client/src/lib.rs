//! # Fieldsync Client
//!
//! Async runtime of the fieldsync offline sync engine: a durable operation
//! queue, a priority-ordered drain/retry scheduler, conflict resolution and
//! optimistic entity writes, on top of pluggable store and transport
//! collaborators.
//!
//! The decisions themselves (ordering, retry policy, conflict merge, write
//! state machine) live in `fieldsync-engine`; this crate adds IO, timers,
//! concurrency and logging.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fieldsync_client::{
//!     MemoryStore, MutationRequest, StaticToken, SyncConfig, SyncRuntime,
//! };
//! use fieldsync_engine::{EntityRef, Method, OperationKind};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! fieldsync_client::telemetry::init();
//!
//! let config = SyncConfig::from_env()?;
//! let mut runtime = SyncRuntime::http(
//!     config,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(StaticToken::new("token")),
//! )?;
//! runtime.start()?;
//! runtime.connectivity().set_online(true);
//!
//! let patch = json!({"status": "en_route"}).as_object().cloned().unwrap_or_default();
//! let outcome = runtime
//!     .coordinator()
//!     .mutate(MutationRequest::new(
//!         EntityRef::new("work_order", "17"),
//!         OperationKind::StatusChange,
//!         Method::Patch,
//!         "/work-orders/17",
//!         patch,
//!     ))
//!     .await?;
//! println!("version {}", outcome.entity().version);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod queue;
pub mod records;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig, DEFAULT_BATCH_SIZE};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use coordinator::{MutationOutcome, MutationRequest, SyncCoordinator};
pub use error::{Result, SyncError};
pub use queue::{OperationQueue, QueueCounts};
pub use records::LocalRecordStore;
pub use resolver::ConflictResolver;
pub use runtime::SyncRuntime;
pub use scheduler::{DrainOutcome, DrainReport, SyncScheduler, SyncState, SyncStatus};
pub use store::{DurableStore, MemoryStore, StoreError};
pub use transport::{
    AuthTokenProvider, HttpTransport, StaticToken, Transport, TransportError, TransportRequest,
    TransportResponse,
};
