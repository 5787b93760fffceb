//! Durable operation queue.
//!
//! The queue owns every status transition of a stored operation. Each mutation
//! is a read-modify-write of a single record in the durable store; only the
//! scheduler's single in-flight drain writes `Syncing`/`Failed`/`Conflict`, so
//! no further locking is needed.
//!
//! Records that fail to decode are dropped with an error log rather than
//! blocking the rest of the queue.

use fieldsync_engine::{
    decode_operation, encode_operation, sort_for_drain, ConflictContext, EntityRef, Error,
    ErrorClass, FailureOutcome, Method, MonotonicClock, Operation, OperationId, OperationKind,
    OperationStatus, RetryPolicy,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::DurableStore;

/// Key prefix of operation records in the durable store.
const KEY_PREFIX: &str = "op:";

fn key_for(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Number of operations per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
    pub conflict: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.syncing + self.failed + self.conflict
    }
}

/// The durable list of not-yet-confirmed operations.
pub struct OperationQueue {
    store: Arc<dyn DurableStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    stamps: Mutex<MonotonicClock>,
}

impl OperationQueue {
    pub fn new(store: Arc<dyn DurableStore>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
            stamps: Mutex::new(MonotonicClock::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn next_stamp(&self) -> u64 {
        let now = self.clock.now();
        match self.stamps.lock() {
            Ok(mut stamps) => stamps.stamp(now),
            Err(poisoned) => poisoned.into_inner().stamp(now),
        }
    }

    /// Queue a change request. Safe to call while a drain is running; the new
    /// operation is picked up by the next pass.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        method: Method,
        endpoint: impl Into<String>,
        payload: Value,
        entity: Option<EntityRef>,
    ) -> Result<OperationId> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut op = Operation::new(
            id.clone(),
            kind,
            method,
            endpoint,
            payload,
            self.next_stamp(),
            self.policy.max_retries,
        )?;
        op.entity = entity;

        self.save(&op)?;
        tracing::debug!(
            op_id = %id,
            kind = op.kind.as_str(),
            priority = op.priority,
            "Operation enqueued"
        );
        Ok(id)
    }

    fn save(&self, op: &Operation) -> Result<()> {
        self.store.put(&key_for(&op.id), encode_operation(op))?;
        Ok(())
    }

    fn decode_or_drop(&self, key: &str, value: Value) -> Result<Option<Operation>> {
        match decode_operation(key, value) {
            Ok(op) => Ok(Some(op)),
            Err(err) => {
                tracing::error!(key = %key, error = %err, "Dropping corrupt queue record");
                self.store.delete(key)?;
                Ok(None)
            }
        }
    }

    /// Look up one operation.
    pub fn get(&self, id: &str) -> Result<Option<Operation>> {
        let key = key_for(id);
        match self.store.get(&key)? {
            Some(value) => self.decode_or_drop(&key, value),
            None => Ok(None),
        }
    }

    fn load(&self, id: &str) -> Result<Operation> {
        self.get(id)?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()).into())
    }

    /// Apply a transition to a stored operation and persist the result.
    fn update<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Operation) -> fieldsync_engine::error::Result<T>,
    ) -> Result<T> {
        let mut op = self.load(id)?;
        let out = apply(&mut op)?;
        self.save(&op)?;
        Ok(out)
    }

    /// Operations with `status`, in drain order.
    pub fn list_by_status(&self, status: OperationStatus) -> Result<Vec<Operation>> {
        let rows = self
            .store
            .query_by_index("status", &Value::from(status.as_str()))?;

        let mut ops = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }
            if let Some(op) = self.decode_or_drop(&key, value)? {
                ops.push(op);
            }
        }
        sort_for_drain(&mut ops);
        Ok(ops)
    }

    pub fn mark_syncing(&self, id: &str) -> Result<()> {
        self.update(id, Operation::mark_syncing)
    }

    /// Success: the operation is deleted.
    pub fn mark_completed(&self, id: &str) -> Result<()> {
        if !self.store.delete(&key_for(id))? {
            return Err(Error::OperationNotFound(id.to_string()).into());
        }
        Ok(())
    }

    /// Syncing -> Pending without spending retry budget, noting why.
    pub fn requeue(&self, id: &str, reason: &str) -> Result<()> {
        self.update(id, |op| {
            op.requeue()?;
            op.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    /// Record a failed attempt according to the retry policy.
    pub fn mark_failed(&self, id: &str, error: &str, class: ErrorClass) -> Result<FailureOutcome> {
        let policy = &self.policy;
        self.update(id, |op| op.record_failure(error, class, policy))
    }

    pub fn mark_conflict(&self, id: &str, context: ConflictContext) -> Result<()> {
        self.update(id, |op| op.mark_conflict(context))
    }

    /// Replace a conflicted operation's payload with a merged one and make it
    /// pending again with a fresh retry budget.
    pub fn apply_resolution(&self, id: &str, merged: Value) -> Result<()> {
        self.update(id, |op| op.apply_resolution(merged))
    }

    /// Manually retry one failed operation.
    pub fn retry_failed(&self, id: &str) -> Result<()> {
        self.update(id, Operation::reset_for_retry)
    }

    /// Manually retry every failed operation. Returns how many were reset.
    pub fn retry_all_failed(&self) -> Result<usize> {
        let failed = self.list_by_status(OperationStatus::Failed)?;
        for op in &failed {
            self.retry_failed(&op.id)?;
        }
        Ok(failed.len())
    }

    /// Drop one operation regardless of status.
    pub fn discard(&self, id: &str) -> Result<bool> {
        Ok(self.store.delete(&key_for(id))?)
    }

    fn delete_with_status(&self, statuses: &[OperationStatus]) -> Result<usize> {
        let mut removed = 0;
        for status in statuses {
            for op in self.list_by_status(*status)? {
                if self.store.delete(&key_for(&op.id))? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Drop every operation ("discard all").
    pub fn clear(&self) -> Result<usize> {
        let removed = self.delete_with_status(&OperationStatus::ALL)?;
        tracing::info!(removed, "Queue cleared");
        Ok(removed)
    }

    /// Drop terminal entries only. Completed operations are never retained, so
    /// this removes `Failed` ones; `Pending`, `Syncing` and `Conflict` stay.
    pub fn clear_terminal(&self) -> Result<usize> {
        self.delete_with_status(&[OperationStatus::Failed])
    }

    /// Drop every conflicted operation without merging.
    pub fn clear_conflicts(&self) -> Result<Vec<Operation>> {
        let conflicts = self.list_by_status(OperationStatus::Conflict)?;
        for op in &conflicts {
            self.store.delete(&key_for(&op.id))?;
        }
        Ok(conflicts)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            pending: self.list_by_status(OperationStatus::Pending)?.len(),
            syncing: self.list_by_status(OperationStatus::Syncing)?.len(),
            failed: self.list_by_status(OperationStatus::Failed)?.len(),
            conflict: self.list_by_status(OperationStatus::Conflict)?.len(),
        })
    }

    /// Entities that have an unresolved conflict.
    pub fn conflicted_entities(&self) -> Result<HashSet<EntityRef>> {
        Ok(self
            .list_by_status(OperationStatus::Conflict)?
            .into_iter()
            .filter_map(|op| op.entity)
            .collect())
    }

    /// Whether any pending, in-flight or conflicted operation still targets
    /// `entity`.
    pub fn has_outstanding(&self, entity: &EntityRef) -> Result<bool> {
        for status in [
            OperationStatus::Syncing,
            OperationStatus::Pending,
            OperationStatus::Conflict,
        ] {
            if self
                .list_by_status(status)?
                .iter()
                .any(|op| op.entity.as_ref() == Some(entity))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Startup recovery: operations a crash left `Syncing` become `Pending`
    /// again, and enqueue stamps resume after the newest stored one.
    pub fn requeue_interrupted(&self) -> Result<usize> {
        let mut newest = 0;
        for status in OperationStatus::ALL {
            for op in self.list_by_status(status)? {
                newest = newest.max(op.enqueued_at);
            }
        }
        match self.stamps.lock() {
            Ok(mut stamps) => stamps.observe(newest),
            Err(poisoned) => poisoned.into_inner().observe(newest),
        }

        let interrupted = self.list_by_status(OperationStatus::Syncing)?;
        for op in &interrupted {
            self.update(&op.id, Operation::requeue)?;
        }
        if !interrupted.is_empty() {
            tracing::info!(count = interrupted.len(), "Requeued interrupted operations");
        }
        Ok(interrupted.len())
    }
}
