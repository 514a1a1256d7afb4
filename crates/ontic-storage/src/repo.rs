//! The repository protocol shared by both backends.
//!
//! Consumers depend on [`Repository`] rather than on concrete stores so
//! that the transactional and object-store backends are interchangeable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use ontic_core::commit::{ChangeRecord, CommitDraft, CommitInfo, SchemaActivation};
use ontic_core::config::{EngineConfig, EngineVersion};
use ontic_core::descriptor::{RecordKind, TypeDescriptor};
use ontic_core::drift::StoredFieldSpec;
use ontic_core::error::{EngineError, Result};
use ontic_core::event::{DeadLetterRecord, EventRecord, SessionRecord};
use ontic_core::query::{AggregateCall, GroupByRequest, GroupRow, QueryRequest};
use ontic_core::row::StoredRow;
use ontic_core::spec::TypeSpec;

use crate::lease::WriteLease;

/// The authoritative head of a repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadInfo {
    /// Latest committed id; 0 for an empty store.
    pub commit_id: u64,
    /// Manifest path of the head commit (object-store backend only).
    pub manifest_path: Option<String>,
}

/// A stored schema registry entry.
#[derive(Clone, Debug)]
pub struct StoredSchema {
    pub kind: RecordKind,
    pub name: String,
    /// Current schema version for the type.
    pub version: i64,
    /// Registry JSON as persisted.
    pub schema_json: Value,
}

impl StoredSchema {
    /// Parses the registry JSON into a descriptor, when it has the
    /// structured shape.
    pub fn descriptor(&self) -> Result<TypeDescriptor> {
        TypeDescriptor::from_registry_json(&self.schema_json)
    }

    /// Loose field view for drift comparison: structured specs where
    /// available, legacy strings otherwise.
    pub fn stored_fields(&self) -> Vec<(String, StoredFieldSpec)> {
        if let Ok(descriptor) = self.descriptor() {
            return descriptor
                .fields
                .iter()
                .map(|f| (f.name.clone(), StoredFieldSpec::Spec(f.spec.clone())))
                .collect();
        }
        // Legacy shape: {"fields": {"name": "str", ...}}
        let mut out = Vec::new();
        if let Some(fields) = self.schema_json.get("fields").and_then(Value::as_object) {
            for (name, spec) in fields {
                let stored = match spec {
                    Value::String(raw) => StoredFieldSpec::Legacy(raw.clone()),
                    other => match serde_json::from_value::<TypeSpec>(other.clone()) {
                        Ok(parsed) => StoredFieldSpec::Spec(parsed),
                        Err(_) => StoredFieldSpec::Legacy(other.to_string()),
                    },
                };
                out.push((name.clone(), stored));
            }
        }
        out
    }
}

/// One stored schema version row.
#[derive(Clone, Debug)]
pub struct SchemaVersionRecord {
    pub kind: RecordKind,
    pub name: String,
    pub schema_version_id: i64,
    pub schema_json: Value,
    pub schema_hash: String,
    pub created_at: DateTime<Utc>,
    pub runtime_id: String,
    pub reason: String,
    /// Commit at which the version became current.
    pub activation_commit: u64,
}

/// Result of releasing a failed claim.
#[derive(Clone, Debug, PartialEq)]
pub enum ReleaseOutcome {
    /// The claim backs off and becomes reclaimable at `available_at`.
    Backoff {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    /// The claim reached `event_max_attempts` and was dead-lettered.
    DeadLettered { attempts: u32 },
}

/// Report returned by a compaction run.
#[derive(Clone, Debug, Default)]
pub struct CompactionReport {
    /// Per-commit files merged into snapshots.
    pub files_merged: usize,
    /// Snapshot files written.
    pub snapshots_written: usize,
    /// Rows carried into snapshots.
    pub rows: u64,
}

/// Contract implemented by every storage backend.
///
/// All writes are serialised through the write lease; reads are
/// snapshot-consistent against a single observed head; commits fail
/// atomically.
pub trait Repository: Send + Sync {
    /// Storage layout generation of the opened store.
    fn engine_version(&self) -> EngineVersion;

    /// Runtime identifier stamped into commits from this handle.
    fn runtime_id(&self) -> &str;

    /// Engine configuration the repository was opened with.
    fn config(&self) -> &EngineConfig;

    // -- Commit path ---------------------------------------------------------

    /// Reads the authoritative head.
    fn head(&self) -> Result<HeadInfo>;

    /// Acquires the ontology-wide write lease, retrying with jittered
    /// backoff until the configured timeout.
    fn begin_write(&self, owner_id: &str) -> Result<WriteLease>;

    /// Atomically persists a commit under the lease, enforcing the
    /// schema drift check against `draft.expected_versions`. Returns the
    /// new commit id.
    fn append_commit(&self, lease: &WriteLease, draft: CommitDraft) -> Result<u64>;

    /// Registers schema versions without creating a commit (initial
    /// registration); activation commit is the head at call time.
    fn register_schemas(&self, lease: &WriteLease, activations: &[SchemaActivation])
    -> Result<()>;

    // -- Queries -------------------------------------------------------------

    /// Executes a row query.
    fn query_rows(&self, request: &QueryRequest) -> Result<Vec<StoredRow>>;

    /// Executes a scalar aggregate over the query's dedup view.
    fn aggregate(&self, request: &QueryRequest, call: &AggregateCall) -> Result<Value>;

    /// Executes a grouped aggregation.
    fn group_aggregate(&self, request: &QueryRequest, group: &GroupByRequest)
    -> Result<Vec<GroupRow>>;

    // -- Commit inspection ---------------------------------------------------

    /// Lists commits, newest first, optionally bounded below.
    fn list_commits(&self, limit: u64, since_commit_id: Option<u64>) -> Result<Vec<CommitInfo>>;

    /// Fetches one commit.
    fn get_commit(&self, commit_id: u64) -> Result<Option<CommitInfo>>;

    /// Lists the change records of one commit.
    fn list_commit_changes(&self, commit_id: u64) -> Result<Vec<ChangeRecord>>;

    // -- Schema registry -----------------------------------------------------

    /// The stored registry entry for a type, if registered.
    fn stored_schema(&self, kind: RecordKind, name: &str) -> Result<Option<StoredSchema>>;

    /// Current `type_name -> schema_version_id` across both kinds.
    fn current_versions(&self) -> Result<BTreeMap<String, i64>>;

    /// All stored versions of a type, oldest first.
    fn schema_versions(&self, kind: RecordKind, name: &str) -> Result<Vec<SchemaVersionRecord>>;

    /// Activation commit of a specific version, if stored.
    fn activation_commit(&self, kind: RecordKind, name: &str, version: i64) -> Result<Option<u64>>;

    /// Current-state row count for a type (latest mode, current version).
    fn count_current_rows(&self, kind: RecordKind, name: &str, version: i64) -> Result<u64>;

    // -- Event bus -----------------------------------------------------------

    /// Durably appends events.
    fn enqueue_events(&self, events: &[EventRecord]) -> Result<()>;

    /// Atomically claims up to `limit` unclaimed/reclaimable events of
    /// the given types in the namespace, ordered by
    /// `(priority DESC, created_at ASC, id ASC)`.
    fn claim_events(
        &self,
        namespace: &str,
        handler_id: &str,
        session_id: &str,
        event_types: &[String],
        limit: usize,
        lease_ms: u64,
    ) -> Result<Vec<EventRecord>>;

    /// Marks a claim acked (terminal).
    fn ack_event(&self, handler_id: &str, event_id: &str) -> Result<()>;

    /// Releases a failed claim: bumps attempts, schedules backoff or
    /// dead-letters once `event_max_attempts` is reached (writing the
    /// audit row and enqueueing the synthetic `event.dead_letter`).
    fn release_event(
        &self,
        handler_id: &str,
        event_id: &str,
        error: Option<&str>,
    ) -> Result<ReleaseOutcome>;

    /// Fetches one event.
    fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>>;

    /// Re-enqueues a copy of a stored event as a fresh root event.
    fn replay_event(&self, event_id: &str) -> Result<EventRecord>;

    /// Registers a bus session.
    fn register_session(&self, session: &SessionRecord) -> Result<()>;

    /// Updates a session heartbeat.
    fn heartbeat_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Releases all live claims held by a session (graceful stop).
    fn release_session_claims(&self, session_id: &str) -> Result<u64>;

    /// Removes a session registration.
    fn remove_session(&self, session_id: &str) -> Result<()>;

    /// Dead-letter audit rows for a namespace.
    fn list_dead_letters(&self, namespace: &str) -> Result<Vec<DeadLetterRecord>>;

    /// Deletes terminal events older than `older_than` in the namespace,
    /// with their claims. Returns the number of events removed.
    fn gc_events(&self, namespace: &str, older_than: DateTime<Utc>) -> Result<u64>;

    // -- Maintenance ---------------------------------------------------------

    /// Merges per-commit columnar files into snapshots (object-store
    /// backend only).
    fn compact(&self, lease: &WriteLease) -> Result<CompactionReport> {
        let _ = lease;
        Err(EngineError::invalid_context(
            "compaction is only supported on object-store repositories",
        ))
    }
}

/// Opens a repository from a URI.
///
/// Supported schemes: `sqlite:///path/to.db` (and `sqlite://:memory:`),
/// `s3://bucket/prefix`, `mem://name` (in-process object store, shared
/// per name) and `file:///path` (local object store layout).
pub fn open_repository(uri: &str, config: &EngineConfig) -> Result<Box<dyn Repository>> {
    if let Some(rest) = uri.strip_prefix("sqlite://") {
        let store = crate::sqlite::SqliteRepository::open_uri(rest, config)?;
        return Ok(Box::new(store));
    }
    if uri.starts_with("s3://") || uri.starts_with("mem://") || uri.starts_with("file://") {
        let store = crate::s3::ObjectRepository::open_uri(uri, config)?;
        return Ok(Box::new(store));
    }
    Err(EngineError::validation(format!(
        "unsupported repository uri `{uri}`"
    )))
}
