//! Conflict resolution service.
//!
//! Conflicted operations stay in the queue until a user (or a policy) picks a
//! side per field. Resolving replaces the operation payload with the merged
//! entity, resets its retry budget and makes it pending again; the merged
//! entity is also written to the record cache so the UI shows it right away.
//! Discarding drops the local change and restores the server copy.

use fieldsync_engine::{
    apply_resolution, ConflictContext, Error, FieldDiff, Operation, OperationStatus, Resolution,
    Side, VersionedEntity,
};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::scheduler::SyncScheduler;

pub struct ConflictResolver {
    scheduler: Arc<SyncScheduler>,
}

impl ConflictResolver {
    pub fn new(scheduler: Arc<SyncScheduler>) -> Self {
        Self { scheduler }
    }

    /// Every operation waiting for resolution, in drain order.
    pub fn list(&self) -> Result<Vec<Operation>> {
        self.scheduler
            .queue()
            .list_by_status(OperationStatus::Conflict)
    }

    fn conflicted(&self, id: &str) -> Result<(Operation, ConflictContext)> {
        let op = self
            .scheduler
            .queue()
            .get(id)?
            .ok_or_else(|| SyncError::from(Error::OperationNotFound(id.to_string())))?;

        let status = op.status;
        match op.conflict.clone() {
            Some(context) if status == OperationStatus::Conflict => Ok((op, context)),
            _ => Err(SyncError::Validation(format!(
                "operation {id} is {status}, not in conflict"
            ))),
        }
    }

    /// Fields that differ between the local and server copies.
    pub fn diff(&self, id: &str) -> Result<Vec<FieldDiff>> {
        let (_, context) = self.conflicted(id)?;
        Ok(context.differing_fields())
    }

    /// Initial selection shown to the user: server wins everywhere.
    pub fn default_resolution(&self, id: &str) -> Result<Resolution> {
        let (_, context) = self.conflicted(id)?;
        Ok(Resolution::for_context(&context))
    }

    /// Merge with per-field choices and requeue. Returns the merged payload.
    pub fn resolve(&self, id: &str, resolution: &Resolution) -> Result<Value> {
        let (op, context) = self.conflicted(id)?;
        let merged = apply_resolution(&context, resolution)?;

        self.scheduler
            .queue()
            .apply_resolution(id, merged.clone())?;
        self.write_entity(&op, &merged)?;
        self.scheduler.refresh_status();

        let local_fields = resolution
            .choices
            .values()
            .filter(|side| **side == Side::Local)
            .count();
        tracing::info!(
            op_id = %id,
            local_fields,
            server_version = context.server_version,
            "Conflict resolved"
        );
        Ok(merged)
    }

    /// Resolve taking every differing field from the server.
    pub fn accept_all_server(&self, id: &str) -> Result<Value> {
        let (_, context) = self.conflicted(id)?;
        self.resolve(id, &Resolution::accept_all(&context, Side::Server))
    }

    /// Resolve taking every differing field from the local copy.
    pub fn accept_all_local(&self, id: &str) -> Result<Value> {
        let (_, context) = self.conflicted(id)?;
        self.resolve(id, &Resolution::accept_all(&context, Side::Local))
    }

    /// Drop one conflicted operation and restore the server copy locally.
    pub fn discard(&self, id: &str) -> Result<()> {
        let (op, context) = self.conflicted(id)?;
        self.scheduler.queue().discard(id)?;
        self.restore_server(&op, &context)?;
        self.scheduler.refresh_status();
        tracing::info!(op_id = %id, "Conflicted change discarded");
        Ok(())
    }

    /// Drop every conflicted operation without merging.
    pub fn discard_all(&self) -> Result<usize> {
        let dropped = self.scheduler.queue().clear_conflicts()?;
        for op in &dropped {
            if let Some(context) = &op.conflict {
                self.restore_server(op, context)?;
            }
        }
        self.scheduler.refresh_status();
        tracing::info!(count = dropped.len(), "All conflicted changes discarded");
        Ok(dropped.len())
    }

    fn restore_server(&self, op: &Operation, context: &ConflictContext) -> Result<()> {
        self.write_entity(op, &Value::Object(context.server_data.clone()))
    }

    /// Cache `data` as the current state of the operation's entity.
    fn write_entity(&self, op: &Operation, data: &Value) -> Result<()> {
        let Some(entity_ref) = &op.entity else {
            return Ok(());
        };

        let mut data = data.clone();
        if let Some(map) = data.as_object_mut() {
            map.entry("id")
                .or_insert_with(|| Value::from(entity_ref.entity_id.clone()));
        }
        match VersionedEntity::from_value(data) {
            Ok(mut entity) => {
                if entity.updated_at == 0 {
                    entity.updated_at = self.scheduler.clock().now();
                }
                self.scheduler.records().put(entity_ref, &entity)
            }
            Err(err) => {
                tracing::warn!(op_id = %op.id, error = %err, "Conflict data is not an entity");
                Ok(())
            }
        }
    }
}
