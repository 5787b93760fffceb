//! Persisted layout of a queued operation.
//!
//! [`OperationRecord`] is the exact shape written to the durable store. Loading
//! a record back into an [`Operation`] validates it; any violation is reported
//! as [`Error::QueueCorruption`] so the owner can drop that single record
//! instead of blocking the whole queue.

use crate::conflict::ConflictContext;
use crate::error::{Error, Result};
use crate::operation::{EntityRef, Method, Operation, OperationStatus};
use crate::{OperationId, OperationKind, Timestamp};
use serde::{Deserialize, Serialize};

/// Stored form of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: String,
    pub method: String,
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub priority: u32,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_context: Option<ConflictContext>,
}

impl From<&Operation> for OperationRecord {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            kind: op.kind.as_str().to_string(),
            method: op.method.as_str().to_string(),
            endpoint: op.endpoint.clone(),
            payload: op.payload.clone(),
            priority: op.priority,
            enqueued_at: op.enqueued_at,
            retry_count: op.retry_count,
            max_retries: op.max_retries,
            status: op.status.as_str().to_string(),
            last_error: op.last_error.clone(),
            entity_type: op.entity.as_ref().map(|e| e.entity_type.clone()),
            entity_id: op.entity.as_ref().map(|e| e.entity_id.clone()),
            conflict_context: op.conflict.clone(),
        }
    }
}

impl TryFrom<OperationRecord> for Operation {
    type Error = Error;

    fn try_from(record: OperationRecord) -> Result<Self> {
        let id = record.id;
        let corrupt = |reason: String| Error::corruption(id.clone(), reason);

        let method = Method::parse(&record.method)
            .filter(|m| m.is_queueable())
            .ok_or_else(|| corrupt(format!("unsupported method '{}'", record.method)))?;

        let status = OperationStatus::parse(&record.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", record.status)))?;

        if record.max_retries == 0 {
            return Err(corrupt("max retries is zero".into()));
        }
        if record.retry_count > record.max_retries {
            return Err(corrupt(format!(
                "retry count {} exceeds max retries {}",
                record.retry_count, record.max_retries
            )));
        }

        match (status, record.conflict_context.is_some()) {
            (OperationStatus::Conflict, false) => {
                return Err(corrupt("conflict status without conflict context".into()))
            }
            (other, true) if other != OperationStatus::Conflict => {
                return Err(corrupt(format!("conflict context on {other} operation")))
            }
            _ => {}
        }

        let entity = match (record.entity_type, record.entity_id) {
            (Some(entity_type), Some(entity_id)) => Some(EntityRef {
                entity_type,
                entity_id,
            }),
            (None, None) => None,
            _ => return Err(corrupt("half-specified entity reference".into())),
        };

        let kind = OperationKind::from(record.kind);

        Ok(Operation {
            // Priority is re-derived so a changed table applies to old records.
            priority: kind.priority(),
            id,
            kind,
            method,
            endpoint: record.endpoint,
            payload: record.payload,
            enqueued_at: record.enqueued_at,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            status,
            last_error: record.last_error,
            entity,
            conflict: record.conflict_context,
        })
    }
}

impl OperationRecord {
    /// Serialize to a JSON value for the durable store.
    pub fn to_value(&self) -> serde_json::Value {
        // A struct of strings, integers and JSON values always serializes.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode a stored value. `key` names the record in corruption errors.
    pub fn from_value(key: &str, value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::corruption(key, e.to_string()))
    }
}

/// Decode and validate a stored value into an [`Operation`].
pub fn decode_operation(key: &str, value: serde_json::Value) -> Result<Operation> {
    let record = OperationRecord::from_value(key, value)?;
    Operation::try_from(record)
}

/// Encode an [`Operation`] for the durable store.
pub fn encode_operation(op: &Operation) -> serde_json::Value {
    OperationRecord::from(op).to_value()
}
