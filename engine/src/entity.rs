//! Versioned entities and the optimistic write state machine.
//!
//! Any domain record synchronized through the engine is a [`VersionedEntity`]:
//! an id, a server-assigned version and an `updatedAt` stamp, plus a flat map
//! of domain fields. Writes are submitted with the version the writer last
//! observed.
//!
//! An [`EntityWrite`] captures an immutable pre-mutation snapshot before the
//! optimistic patch is applied, so rolling back is a plain restore:
//!
//! ```text
//! OptimisticApplied --confirm--> ServerConfirmed
//!                   --queue----> QueuedForRetry
//!                   --roll_back-> RolledBackAndRefetched
//! ```

use crate::conflict::is_system_field;
use crate::error::{Error, Result};
use crate::{EntityId, Fields, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A domain record with optimistic-concurrency metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedEntity {
    pub id: EntityId,
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub updated_at: Timestamp,
    /// Domain fields (never contains system fields)
    #[serde(flatten)]
    pub fields: Fields,
}

impl VersionedEntity {
    pub fn new(id: impl Into<EntityId>, version: Version, fields: Fields) -> Self {
        let mut fields = fields;
        fields.retain(|name, _| !is_system_field(name));
        Self {
            id: id.into(),
            version,
            updated_at: 0,
            fields,
        }
    }

    /// Parse a server or store representation.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::validation("entity must be a JSON object"));
        };
        let id = match map.remove("id") {
            Some(Value::String(id)) => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(Error::validation("entity is missing an id")),
        };
        let version = map.remove("version").and_then(|v| v.as_u64()).unwrap_or(0);
        let updated_at = map
            .remove("updatedAt")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(Self {
            id,
            version,
            updated_at,
            fields: map,
        })
    }

    /// Full snapshot including system fields.
    pub fn snapshot(&self) -> Fields {
        let mut map = self.fields.clone();
        map.insert("id".into(), Value::from(self.id.clone()));
        map.insert("version".into(), Value::from(self.version));
        map.insert("updatedAt".into(), Value::from(self.updated_at));
        map
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.snapshot())
    }

    /// Fold an authoritative server response into this entity.
    ///
    /// Fields returned by the server replace local ones. The server version is
    /// taken when present; `updatedAt` falls back to `now`.
    pub fn reconcile(&self, response: &Value, now: Timestamp) -> Self {
        let mut next = self.clone();
        next.updated_at = now;

        if let Value::Object(map) = response {
            for (name, value) in map {
                if !is_system_field(name) {
                    next.fields.insert(name.clone(), value.clone());
                }
            }
            if let Some(version) = map.get("version").and_then(Value::as_u64) {
                next.version = version;
            }
            if let Some(updated_at) = map.get("updatedAt").and_then(Value::as_u64) {
                next.updated_at = updated_at;
            }
        }
        next
    }

    /// Replace this entity with an authoritative server copy, refusing to move
    /// the version backwards.
    pub fn accept(&self, server: VersionedEntity) -> Result<Self> {
        if server.version < self.version {
            return Err(Error::VersionRegression {
                current: self.version,
                proposed: server.version,
            });
        }
        Ok(server)
    }
}

/// Validate an optimistic patch.
pub fn validate_patch(patch: &Fields) -> Result<()> {
    if patch.is_empty() {
        return Err(Error::validation("patch is empty"));
    }
    if let Some(field) = patch.keys().find(|name| is_system_field(name)) {
        return Err(Error::validation(format!(
            "field '{field}' is managed by the server"
        )));
    }
    Ok(())
}

/// State of an optimistic entity write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    OptimisticApplied,
    ServerConfirmed,
    QueuedForRetry,
    RolledBackAndRefetched,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriteState::OptimisticApplied => "optimistic_applied",
            WriteState::ServerConfirmed => "server_confirmed",
            WriteState::QueuedForRetry => "queued_for_retry",
            WriteState::RolledBackAndRefetched => "rolled_back_and_refetched",
        };
        f.write_str(s)
    }
}

/// One optimistic write against an entity.
#[derive(Debug, Clone)]
pub struct EntityWrite {
    snapshot: VersionedEntity,
    optimistic: VersionedEntity,
    patch: Fields,
    state: WriteState,
}

impl EntityWrite {
    /// Apply `patch` optimistically: new fields, local-only `version + 1`.
    pub fn begin(current: &VersionedEntity, patch: Fields, now: Timestamp) -> Result<Self> {
        validate_patch(&patch)?;

        let mut optimistic = current.clone();
        for (name, value) in &patch {
            optimistic.fields.insert(name.clone(), value.clone());
        }
        optimistic.version = current.version + 1;
        optimistic.updated_at = now;

        Ok(Self {
            snapshot: current.clone(),
            optimistic,
            patch,
            state: WriteState::OptimisticApplied,
        })
    }

    /// Pre-mutation snapshot.
    pub fn snapshot(&self) -> &VersionedEntity {
        &self.snapshot
    }

    /// Optimistically mutated entity.
    pub fn optimistic(&self) -> &VersionedEntity {
        &self.optimistic
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    /// The version the server is expected to still have.
    pub fn expected_version(&self) -> Version {
        self.snapshot.version
    }

    /// Request body: the patch plus the expected server version.
    pub fn payload(&self) -> Value {
        let mut body = self.patch.clone();
        body.insert("version".into(), Value::from(self.expected_version()));
        Value::Object(body)
    }

    fn transition(&mut self, to: WriteState) -> Result<()> {
        if self.state != WriteState::OptimisticApplied {
            return Err(Error::InvalidTransition {
                id: self.snapshot.id.clone(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// The server accepted the write; returns the authoritative entity.
    pub fn confirm(&mut self, response: &Value, now: Timestamp) -> Result<VersionedEntity> {
        self.transition(WriteState::ServerConfirmed)?;
        let confirmed = self.optimistic.reconcile(response, now);
        // A server that does not echo a version still accepted exactly one write.
        let confirmed = VersionedEntity {
            version: confirmed.version.max(self.snapshot.version + 1),
            ..confirmed
        };
        Ok(confirmed)
    }

    /// The write could not be sent and was queued.
    pub fn queue(&mut self) -> Result<()> {
        self.transition(WriteState::QueuedForRetry)
    }

    /// The server reported a stale write; returns the pre-mutation snapshot.
    pub fn roll_back(&mut self) -> Result<VersionedEntity> {
        self.transition(WriteState::RolledBackAndRefetched)?;
        Ok(self.snapshot.clone())
    }
}
