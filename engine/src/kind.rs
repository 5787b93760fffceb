//! Operation kinds and their static priority table.
//!
//! The kind of an operation only decides two things: how urgently it is drained
//! (lower priority number first) and the label shown to the user. Every kind is
//! matched exhaustively, so adding a variant without a priority fails to compile.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority assigned to kinds the engine does not recognise.
pub const UNKNOWN_PRIORITY: u32 = 99;

/// Domain-specific type of a queued change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    /// Work order completion report
    Completion,
    /// Work order status transition
    StatusChange,
    /// Technician (re)assignment
    Assignment,
    /// Waste / disposal record
    Waste,
    /// Parts consumed on site
    PartsUsage,
    /// Customer signature capture
    Signature,
    /// Photo or document upload
    Attachment,
    /// Free-text note
    Note,
    /// Any kind this build does not know about. Kept verbatim so persisted
    /// queues written by other versions still load.
    Unknown(String),
}

impl OperationKind {
    /// Drain priority (lower = more urgent).
    pub fn priority(&self) -> u32 {
        match self {
            OperationKind::Completion => 1,
            OperationKind::StatusChange | OperationKind::Assignment => 2,
            OperationKind::Waste | OperationKind::PartsUsage | OperationKind::Signature => 3,
            OperationKind::Attachment => 4,
            OperationKind::Note => 5,
            OperationKind::Unknown(_) => UNKNOWN_PRIORITY,
        }
    }

    /// User-facing label.
    pub fn label(&self) -> &str {
        match self {
            OperationKind::Completion => "Order completion",
            OperationKind::StatusChange => "Status change",
            OperationKind::Assignment => "Assignment",
            OperationKind::Waste => "Waste record",
            OperationKind::PartsUsage => "Parts usage",
            OperationKind::Signature => "Signature",
            OperationKind::Attachment => "Attachment",
            OperationKind::Note => "Note",
            OperationKind::Unknown(name) => name,
        }
    }

    /// Wire name, as persisted.
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Completion => "completion",
            OperationKind::StatusChange => "status_change",
            OperationKind::Assignment => "assignment",
            OperationKind::Waste => "waste",
            OperationKind::PartsUsage => "parts_usage",
            OperationKind::Signature => "signature",
            OperationKind::Attachment => "attachment",
            OperationKind::Note => "note",
            OperationKind::Unknown(name) => name,
        }
    }
}

impl From<&str> for OperationKind {
    fn from(value: &str) -> Self {
        match value {
            "completion" => OperationKind::Completion,
            "status_change" => OperationKind::StatusChange,
            "assignment" => OperationKind::Assignment,
            "waste" => OperationKind::Waste,
            "parts_usage" => OperationKind::PartsUsage,
            "signature" => OperationKind::Signature,
            "attachment" => OperationKind::Attachment,
            "note" => OperationKind::Note,
            other => OperationKind::Unknown(other.to_string()),
        }
    }
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        OperationKind::from(value.as_str())
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
