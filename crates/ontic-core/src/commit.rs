//! Commits and change records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::RecordKind;
use crate::identity::Identity;

/// The operation a change performed on its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// First row for the identity.
    Insert,
    /// A new version row appended for an existing identity.
    UpdateVersion,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::UpdateVersion => "update_version",
        }
    }
}

/// One change inside a commit, as recorded in the audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: RecordKind,
    pub type_name: String,
    pub identity: Identity,
    pub operation: ChangeOp,
}

/// A committed, inspectable unit of change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Monotonic commit id; the first commit is 1.
    pub commit_id: u64,
    pub created_at: DateTime<Utc>,
    /// Identifier of the runtime that produced the commit.
    pub runtime_id: String,
    /// User-supplied string-keyed metadata.
    pub metadata: BTreeMap<String, String>,
}

/// A change with its payload, ready to persist.
#[derive(Clone, Debug)]
pub struct ChangeWrite {
    pub record: ChangeRecord,
    /// Canonical payload (identity and instance-key fields excluded).
    pub payload: Value,
    /// Schema version the payload was validated against.
    pub schema_version_id: i64,
}

/// A new schema version to activate atomically with a commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaActivation {
    pub kind: RecordKind,
    pub type_name: String,
    /// The version being activated.
    pub schema_version_id: i64,
    /// Registry JSON of the descriptor at this version.
    pub schema_json: Value,
    /// Fingerprint of the descriptor.
    pub schema_hash: String,
    /// Why the version was created (registration, migration, ...).
    pub reason: String,
}

/// Everything `append_commit` persists atomically.
#[derive(Clone, Debug, Default)]
pub struct CommitDraft {
    pub changes: Vec<ChangeWrite>,
    pub metadata: BTreeMap<String, String>,
    /// `type_name -> schema_version_id` the writer validated against;
    /// checked under the lease, mismatch aborts with `SchemaOutdated`.
    pub expected_versions: BTreeMap<String, i64>,
    /// Schema versions to activate in the same atomic unit (migrations
    /// and first registration).
    pub schema_activations: Vec<SchemaActivation>,
}

impl CommitDraft {
    /// Returns `true` if the draft carries nothing to persist.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.schema_activations.is_empty()
    }
}
