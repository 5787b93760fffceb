//! Durable key/value store abstraction.
//!
//! The engine treats persistence as an external collaborator: a crash-consistent
//! key/value store with a small index query. Both the operation queue and the
//! local record cache sit on top of this trait.

mod memory;

pub use memory::MemoryStore;

use serde_json::Value;

/// Errors reported by a store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("store is unavailable")]
    Unavailable,
}

/// A durable, crash-consistent key/value store.
///
/// Calls are synchronous; implementations are expected to be fast enough to
/// call from async code.
pub trait DurableStore: Send + Sync {
    fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn bulk_put(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError>;

    /// All `(key, value)` pairs whose top-level `field` equals `value`,
    /// ordered by key.
    fn query_by_index(&self, field: &str, value: &Value)
        -> Result<Vec<(String, Value)>, StoreError>;
}
