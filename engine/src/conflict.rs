//! Field-level conflict detection and merge.
//!
//! When the server rejects a write because the version it was based on is
//! stale, the local and server snapshots are captured in a [`ConflictContext`].
//! Only fields whose values differ (ignoring system fields) are offered for
//! resolution. Every differing field starts out as "server wins", including
//! critical ones; critical fields are only flagged for attention.
//!
//! # Merge
//!
//! 1. Start from the server snapshot
//! 2. Overlay every field the resolution chose as `Local`
//! 3. Set `version` to the server version, so the retried write passes the
//!    optimistic concurrency check

use crate::error::{Error, Result};
use crate::{Fields, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Fields managed by the server, never diffed or merged.
pub const SYSTEM_FIELDS: [&str; 3] = ["id", "version", "updatedAt"];

/// Fields that need explicit user attention when they conflict.
pub const CRITICAL_FIELDS: [&str; 5] = [
    "status",
    "assignee",
    "assignedTo",
    "technicianId",
    "serialNumber",
];

pub fn is_system_field(field: &str) -> bool {
    SYSTEM_FIELDS.contains(&field)
}

pub fn is_critical_field(field: &str) -> bool {
    CRITICAL_FIELDS.contains(&field)
}

/// Read the `version` field of a snapshot, 0 when absent or malformed.
pub fn version_of(fields: &Fields) -> Version {
    fields.get("version").and_then(Value::as_u64).unwrap_or(0)
}

/// Captured server/local snapshot pair of a conflicting write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictContext {
    pub server_version: Version,
    pub local_version: Version,
    pub server_data: Fields,
    pub local_data: Fields,
    pub captured_at: Timestamp,
}

/// One field whose local and server values differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub field: String,
    /// `None` when the field is absent locally
    pub local: Option<Value>,
    /// `None` when the field is absent on the server
    pub server: Option<Value>,
    pub critical: bool,
}

impl ConflictContext {
    pub fn new(
        server_data: Fields,
        server_version: Version,
        local_data: Fields,
        local_version: Version,
        captured_at: Timestamp,
    ) -> Self {
        Self {
            server_version,
            local_version,
            server_data,
            local_data,
            captured_at,
        }
    }

    /// Build a context from two entity snapshots, reading each side's version
    /// from its `version` field.
    pub fn build(local: &Fields, server: &Fields, captured_at: Timestamp) -> Self {
        Self::new(
            server.clone(),
            version_of(server),
            local.clone(),
            version_of(local),
            captured_at,
        )
    }

    /// Fields whose values differ, sorted by name. System fields are skipped.
    pub fn differing_fields(&self) -> Vec<FieldDiff> {
        let mut names: Vec<&String> = self
            .local_data
            .keys()
            .chain(self.server_data.keys())
            .filter(|name| !is_system_field(name))
            .collect();
        names.sort();
        names.dedup();

        names
            .into_iter()
            .filter_map(|name| {
                let local = self.local_data.get(name);
                let server = self.server_data.get(name);
                if local == server {
                    return None;
                }
                Some(FieldDiff {
                    field: name.clone(),
                    local: local.cloned(),
                    server: server.cloned(),
                    critical: is_critical_field(name),
                })
            })
            .collect()
    }

    /// Whether any differing field is critical.
    pub fn requires_attention(&self) -> bool {
        self.differing_fields().iter().any(|diff| diff.critical)
    }
}

/// Which side wins for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Server,
    Local,
}

/// Per-field choices for a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub choices: BTreeMap<String, Side>,
}

impl Resolution {
    /// Default selection: server wins for every differing field.
    pub fn for_context(context: &ConflictContext) -> Self {
        Self::accept_all(context, Side::Server)
    }

    /// Bulk-set every differing field to one side.
    pub fn accept_all(context: &ConflictContext, side: Side) -> Self {
        let choices = context
            .differing_fields()
            .into_iter()
            .map(|diff| (diff.field, side))
            .collect();
        Self { choices }
    }

    /// Change the choice for one field.
    pub fn choose(&mut self, field: &str, side: Side) -> Result<()> {
        match self.choices.get_mut(field) {
            Some(choice) => {
                *choice = side;
                Ok(())
            }
            None => Err(Error::UnknownConflictField(field.to_string())),
        }
    }

    pub fn choice(&self, field: &str) -> Option<Side> {
        self.choices.get(field).copied()
    }
}

/// Merge a conflict according to `resolution`.
///
/// Fields missing from the resolution keep the server value. Choosing `Local`
/// for a field that is absent locally removes it from the merged payload.
pub fn apply_resolution(context: &ConflictContext, resolution: &Resolution) -> Result<Value> {
    let differing: Vec<String> = context
        .differing_fields()
        .into_iter()
        .map(|diff| diff.field)
        .collect();

    if let Some(unknown) = resolution
        .choices
        .keys()
        .find(|field| !differing.contains(field))
    {
        return Err(Error::UnknownConflictField(unknown.clone()));
    }

    let mut merged = context.server_data.clone();
    for (field, side) in &resolution.choices {
        if *side != Side::Local {
            continue;
        }
        match context.local_data.get(field) {
            Some(value) => {
                merged.insert(field.clone(), value.clone());
            }
            None => {
                merged.remove(field);
            }
        }
    }
    merged.insert("version".to_string(), Value::from(context.server_version));

    Ok(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn status_conflict() -> ConflictContext {
        let local = fields(json!({
            "id": "wo-1",
            "version": 3,
            "updatedAt": 100,
            "status": "completed",
            "notes": "replaced filter",
        }));
        let server = fields(json!({
            "id": "wo-1",
            "version": 4,
            "updatedAt": 200,
            "status": "cancelled",
            "notes": "replaced filter",
        }));
        ConflictContext::build(&local, &server, 300)
    }

    #[test]
    fn build_reads_versions() {
        let context = status_conflict();
        assert_eq!(context.local_version, 3);
        assert_eq!(context.server_version, 4);
        assert_eq!(context.captured_at, 300);
    }

    #[test]
    fn diff_skips_system_and_equal_fields() {
        let diffs = status_conflict().differing_fields();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field, "status");
        assert_eq!(diffs[0].local, Some(json!("completed")));
        assert_eq!(diffs[0].server, Some(json!("cancelled")));
        assert!(diffs[0].critical);
    }

    #[test]
    fn diff_includes_one_sided_fields() {
        let local = fields(json!({"a": 1, "b": 2}));
        let server = fields(json!({"a": 1, "c": 3}));
        let diffs = ConflictContext::build(&local, &server, 0).differing_fields();
        let names: Vec<_> = diffs.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(diffs[0].server, None);
        assert_eq!(diffs[1].local, None);
        assert!(!diffs[0].critical);
    }

    #[test]
    fn default_resolution_is_server_everywhere() {
        let context = status_conflict();
        let resolution = Resolution::for_context(&context);
        assert_eq!(resolution.choice("status"), Some(Side::Server));

        let merged = apply_resolution(&context, &resolution).unwrap();
        assert_eq!(merged["status"], "cancelled");
        assert_eq!(merged["version"], 4);
    }

    #[test]
    fn local_choice_only_changes_that_field() {
        let context = status_conflict();
        let mut resolution = Resolution::for_context(&context);
        resolution.choose("status", Side::Local).unwrap();

        let merged = apply_resolution(&context, &resolution).unwrap();
        let mut expected = context.server_data.clone();
        expected.insert("status".into(), json!("completed"));
        expected.insert("version".into(), json!(4));
        assert_eq!(merged, Value::Object(expected));
    }

    #[test]
    fn accept_all_local() {
        let local = fields(json!({"version": 1, "status": "done", "qty": 2}));
        let server = fields(json!({"version": 5, "status": "open", "qty": 1, "extra": true}));
        let context = ConflictContext::build(&local, &server, 0);

        let merged = apply_resolution(&context, &Resolution::accept_all(&context, Side::Local))
            .unwrap();
        assert_eq!(merged, json!({"version": 5, "status": "done", "qty": 2}));
    }

    #[test]
    fn choosing_unknown_field_fails() {
        let context = status_conflict();
        let mut resolution = Resolution::for_context(&context);
        let err = resolution.choose("notes", Side::Local).unwrap_err();
        assert_eq!(err, Error::UnknownConflictField("notes".into()));
    }

    #[test]
    fn foreign_resolution_key_fails() {
        let context = status_conflict();
        let mut resolution = Resolution::default();
        resolution.choices.insert("version".into(), Side::Local);
        assert!(apply_resolution(&context, &resolution).is_err());
    }

    #[test]
    fn requires_attention_for_critical_fields() {
        assert!(status_conflict().requires_attention());

        let local = fields(json!({"notes": "a"}));
        let server = fields(json!({"notes": "b"}));
        assert!(!ConflictContext::build(&local, &server, 0).requires_attention());
    }

    #[test]
    fn context_serializes_camel_case() {
        let json = serde_json::to_value(status_conflict()).unwrap();
        assert!(json.get("serverVersion").is_some());
        assert!(json.get("localData").is_some());
        assert!(json.get("capturedAt").is_some());
    }
}
