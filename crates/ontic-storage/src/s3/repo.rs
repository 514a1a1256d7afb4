//! [`ObjectRepository`] -- the object-store backend.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use ontic_core::canonical::sha256_hex;
use ontic_core::commit::{ChangeOp, ChangeRecord, CommitDraft, CommitInfo, SchemaActivation};
use ontic_core::config::{EngineConfig, EngineVersion};
use ontic_core::descriptor::{RecordKind, TypeDescriptor};
use ontic_core::drift::{SchemaDrift, TypeDrift};
use ontic_core::error::{EngineError, Result};
use ontic_core::query::{
    AggFunc, AggregateCall, EndpointSide, GroupByRequest, GroupRow, QueryRequest, TemporalMode,
};
use ontic_core::row::StoredRow;

use crate::lease::WriteLease;
use crate::repo::{HeadInfo, SchemaVersionRecord, StoredSchema};
use crate::s3::manifest::{HeadObject, Manifest, ManifestFile, read_head, walk_chain};
use crate::s3::{Store, index, layout, lockobj, parq, scan, store_for_uri};

/// Head-CAS retry budget per commit attempt.
const CAS_RETRY_BUDGET: u32 = 5;

/// `meta/engine.json`.
#[derive(Debug, Serialize, Deserialize)]
struct EngineObject {
    engine_version: String,
    created_at: chrono::DateTime<Utc>,
}

/// One known type in `meta/schema/types.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TypeEntry {
    pub kind: RecordKind,
    pub name: String,
    pub current_version: i64,
}

/// One stored version in `meta/schema/versions/<kind>/<name>.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct VersionEntry {
    schema_version_id: i64,
    schema_json: Value,
    schema_hash: String,
    created_at: chrono::DateTime<Utc>,
    runtime_id: String,
    reason: String,
    activation_commit: u64,
}

/// Object-store implementation of [`crate::repo::Repository`].
pub struct ObjectRepository {
    pub(crate) store: Arc<Store>,
    pub(crate) config: EngineConfig,
    pub(crate) engine: EngineVersion,
    pub(crate) runtime_id: String,
}

impl ObjectRepository {
    /// Opens a repository for an `s3://`, `mem://` or `file://` URI.
    pub fn open_uri(uri: &str, config: &EngineConfig) -> Result<Self> {
        let store = Arc::new(store_for_uri(uri, config)?);
        let engine = Self::resolve_engine_version(&store, config)?;
        debug!(uri, engine = engine.as_str(), "object repository opened");
        Ok(Self {
            store,
            config: config.clone(),
            engine,
            runtime_id: Uuid::new_v4().to_string(),
        })
    }

    fn resolve_engine_version(store: &Store, config: &EngineConfig) -> Result<EngineVersion> {
        if let Some((engine, _)) = store.get_json::<EngineObject>(layout::META_ENGINE)? {
            return EngineVersion::parse(&engine.engine_version).ok_or_else(|| {
                EngineError::metadata(format!(
                    "unknown engine version `{}` in {}",
                    engine.engine_version,
                    layout::META_ENGINE
                ))
            });
        }
        // Head present without engine metadata: a legacy v1 layout.
        let (head, _) = read_head(store)?;
        let engine = if head.commit_id > 0 {
            EngineVersion::V1
        } else {
            config.engine_version
        };
        let _ = store.put_json_create(
            layout::META_ENGINE,
            &EngineObject {
                engine_version: engine.as_str().to_string(),
                created_at: Utc::now(),
            },
        )?;
        Ok(engine)
    }

    // -- Schema metadata -----------------------------------------------------

    fn registry_map(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .store
            .get_json::<BTreeMap<String, Value>>(layout::REGISTRY)?
            .map(|(m, _)| m)
            .unwrap_or_default())
    }

    fn type_entries(&self) -> Result<Vec<TypeEntry>> {
        Ok(self
            .store
            .get_json::<Vec<TypeEntry>>(layout::TYPES)?
            .map(|(t, _)| t)
            .unwrap_or_default())
    }

    fn version_entries(&self, kind: RecordKind, name: &str) -> Result<Vec<VersionEntry>> {
        Ok(self
            .store
            .get_json::<Vec<VersionEntry>>(&layout::versions_path(kind, name))?
            .map(|(v, _)| v)
            .unwrap_or_default())
    }

    fn registry_key(kind: RecordKind, name: &str) -> String {
        format!("{}:{name}", kind.as_str())
    }

    /// Applies schema activations to the registry mirrors. The manifest
    /// chain already carries them; these objects are advisory.
    fn apply_activations_meta(
        &self,
        activations: &[SchemaActivation],
        activation_commit: u64,
    ) -> Result<()> {
        if activations.is_empty() {
            return Ok(());
        }
        let mut registry = self.registry_map()?;
        let mut types = self.type_entries()?;
        for activation in activations {
            let mut versions = self.version_entries(activation.kind, &activation.type_name)?;
            if !versions
                .iter()
                .any(|v| v.schema_version_id == activation.schema_version_id)
            {
                versions.push(VersionEntry {
                    schema_version_id: activation.schema_version_id,
                    schema_json: activation.schema_json.clone(),
                    schema_hash: activation.schema_hash.clone(),
                    created_at: Utc::now(),
                    runtime_id: self.runtime_id.clone(),
                    reason: activation.reason.clone(),
                    activation_commit,
                });
                versions.sort_by_key(|v| v.schema_version_id);
                self.store.put_json(
                    &layout::versions_path(activation.kind, &activation.type_name),
                    &versions,
                )?;
            }

            registry.insert(
                Self::registry_key(activation.kind, &activation.type_name),
                activation.schema_json.clone(),
            );
            match types
                .iter_mut()
                .find(|t| t.kind == activation.kind && t.name == activation.type_name)
            {
                Some(entry) => {
                    entry.current_version = entry.current_version.max(activation.schema_version_id)
                }
                None => types.push(TypeEntry {
                    kind: activation.kind,
                    name: activation.type_name.clone(),
                    current_version: activation.schema_version_id,
                }),
            }
        }
        self.store.put_json(layout::REGISTRY, &registry)?;
        self.store.put_json(layout::TYPES, &types)?;
        Ok(())
    }

    fn check_expected_versions(&self, expected: &BTreeMap<String, i64>) -> Result<()> {
        if expected.is_empty() {
            return Ok(());
        }
        let types = self.type_entries()?;
        let mut drifted = Vec::new();
        for (type_name, expected_version) in expected {
            let stored = types
                .iter()
                .find(|t| &t.name == type_name)
                .map(|t| t.current_version);
            if stored != Some(*expected_version) {
                drifted.push(TypeDrift {
                    kind: None,
                    type_name: type_name.clone(),
                    stored_version: stored,
                    ..TypeDrift::default()
                });
            }
        }
        if drifted.is_empty() {
            Ok(())
        } else {
            Err(EngineError::SchemaOutdated {
                drift: SchemaDrift { types: drifted },
            })
        }
    }

    // -- Commit path ---------------------------------------------------------

    pub(crate) fn append_commit_impl(&self, lease: &WriteLease, draft: CommitDraft) -> Result<u64> {
        lease.guard(Utc::now())?;
        if draft.changes.len() > self.config.max_batch_size {
            return Err(EngineError::BatchSizeExceeded {
                size: draft.changes.len(),
                limit: self.config.max_batch_size,
            });
        }

        let mut attempt_no: u32 = 0;
        loop {
            let (head, head_etag) = read_head(&self.store)?;
            self.check_expected_versions(&draft.expected_versions)?;

            let next_cid = head.commit_id + 1;
            let attempt = format!("{:08x}", rand::thread_rng().r#gen::<u32>());

            // Group changes per (kind, type, version) data file.
            let mut groups: BTreeMap<(String, i64), Vec<StoredRow>> = BTreeMap::new();
            let mut group_kinds: BTreeMap<(String, i64), RecordKind> = BTreeMap::new();
            for change in &draft.changes {
                let key = (change.record.type_name.clone(), change.schema_version_id);
                group_kinds.insert(key.clone(), change.record.kind);
                groups.entry(key).or_default().push(StoredRow {
                    kind: change.record.kind,
                    type_name: change.record.type_name.clone(),
                    identity: change.record.identity.clone(),
                    fields: change.payload.clone(),
                    commit_id: next_cid,
                    schema_version_id: change.schema_version_id,
                });
            }

            let mut files = Vec::new();
            for ((type_name, version), rows) in &groups {
                let kind = group_kinds[&(type_name.clone(), *version)];
                let descriptor = self.descriptor_for_write(kind, type_name, &draft)?;
                let bytes = parq::write_rows(&descriptor, rows)?;
                let path = layout::data_path(next_cid, &attempt, kind, type_name, *version, self.engine);
                let sha = sha256_hex(&bytes);
                self.store.put(&path, bytes)?;
                files.push(ManifestFile {
                    kind,
                    type_name: type_name.clone(),
                    path,
                    row_count: rows.len() as u64,
                    schema_version_id: *version,
                    content_sha256: sha,
                });
            }

            let manifest_path = layout::manifest_path(next_cid, &attempt);
            let manifest = Manifest {
                commit_id: next_cid,
                parent_commit_id: head.commit_id,
                parent_manifest_path: head.manifest_path.clone(),
                created_at: Utc::now(),
                runtime_id: self.runtime_id.clone(),
                metadata: draft.metadata.clone(),
                files,
                schema_activations: draft.schema_activations.clone(),
            };
            self.store.put_json(&manifest_path, &manifest)?;

            // Lease-expiry guard immediately before the linearisation
            // point; orphan attempt files are ignored by all readers.
            lease.guard(Utc::now())?;

            let new_head = HeadObject {
                commit_id: next_cid,
                manifest_path: Some(manifest_path.clone()),
                updated_at: Utc::now(),
                runtime_id: self.runtime_id.clone(),
            };
            match self
                .store
                .put_json_if_match(layout::HEAD, &new_head, head_etag)?
            {
                crate::s3::CasOutcome::Stored(_) => {
                    // Post-CAS success rule: the commit is durable from
                    // here on; metadata and index updates are best-effort.
                    if let Err(e) = self.post_cas_updates(&new_head, &manifest) {
                        warn!(commit_id = next_cid, error = %e, "post-commit index update failed");
                    }
                    debug!(commit_id = next_cid, "commit appended");
                    return Ok(next_cid);
                }
                crate::s3::CasOutcome::Conflict => {
                    attempt_no += 1;
                    if attempt_no >= CAS_RETRY_BUDGET {
                        let (observed, _) = read_head(&self.store)?;
                        return Err(EngineError::HeadMismatch {
                            expected: next_cid,
                            observed: observed.commit_id,
                        });
                    }
                    let backoff = 50u64 * (1 << attempt_no.min(6))
                        + rand::thread_rng().gen_range(0..50);
                    warn!(
                        commit_id = next_cid,
                        attempt_no, "head CAS conflict; retrying"
                    );
                    std::thread::sleep(std::time::Duration::from_millis(backoff));
                }
            }
        }
    }

    /// Descriptor for writing a type: activations carried by the draft
    /// win over the stored registry (migration commits write under the
    /// version they activate).
    fn descriptor_for_write(
        &self,
        kind: RecordKind,
        type_name: &str,
        draft: &CommitDraft,
    ) -> Result<TypeDescriptor> {
        if let Some(activation) = draft
            .schema_activations
            .iter()
            .find(|a| a.kind == kind && a.type_name == type_name)
        {
            return TypeDescriptor::from_registry_json(&activation.schema_json);
        }
        let registry = self.registry_map()?;
        let schema_json = registry
            .get(&Self::registry_key(kind, type_name))
            .ok_or_else(|| EngineError::metadata(format!("type {type_name} is not registered")))?;
        TypeDescriptor::from_registry_json(schema_json)
    }

    /// Step 8: registry mirrors and advisory indices, with opportunistic
    /// gap repair. Failure leaves a degraded-but-correct state.
    fn post_cas_updates(&self, head: &HeadObject, manifest: &Manifest) -> Result<()> {
        self.apply_activations_meta(&manifest.schema_activations, manifest.commit_id)?;
        for entry in self.type_entries()? {
            let repaired = index::resolve_index(&self.store, entry.kind, &entry.name, head)?;
            index::write_index(&self.store, entry.kind, &entry.name, &repaired)?;
        }
        Ok(())
    }

    pub(crate) fn register_schemas_impl(
        &self,
        lease: &WriteLease,
        activations: &[SchemaActivation],
    ) -> Result<()> {
        lease.guard(Utc::now())?;
        let (head, _) = read_head(&self.store)?;
        self.apply_activations_meta(activations, head.commit_id)
    }

    // -- Read path -----------------------------------------------------------

    fn activation_commit_of(
        &self,
        kind: RecordKind,
        name: &str,
        version: i64,
    ) -> Result<Option<u64>> {
        Ok(self
            .version_entries(kind, name)?
            .into_iter()
            .find(|v| v.schema_version_id == version)
            .map(|v| v.activation_commit))
    }

    fn before_activation(&self, request: &QueryRequest) -> Result<bool> {
        let TemporalMode::AsOf(as_of) = request.temporal else {
            return Ok(false);
        };
        let activation = self
            .activation_commit_of(request.kind, &request.type_name, request.schema_version)?
            .unwrap_or(0);
        if as_of < activation {
            debug!(
                type_name = %request.type_name,
                as_of,
                activation,
                "commit_before_activation: as_of precedes current schema version"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Loads, windows and filters the rows a request addresses. Shared by
    /// row queries and aggregation.
    fn collect_rows(&self, request: &QueryRequest) -> Result<Vec<StoredRow>> {
        let (head, _) = read_head(&self.store)?;
        if head.commit_id == 0 || self.before_activation(request)? {
            return Ok(Vec::new());
        }
        let window_end = match request.temporal {
            TemporalMode::AsOf(c) => c.min(head.commit_id),
            _ => head.commit_id,
        };

        let idx = index::resolve_index(&self.store, request.kind, &request.type_name, &head)?;
        let mut rows = Vec::new();
        for entry in idx.entries_in_window(1, window_end, Some(request.schema_version)) {
            let fetched = self.store.get(&entry.path)?.ok_or_else(|| {
                EngineError::metadata(format!("indexed file {} is missing", entry.path))
            })?;
            let decoded = parq::read_rows(request.kind, fetched.bytes)?;
            rows.extend(decoded.into_iter().filter(|r| {
                r.type_name == request.type_name && r.schema_version_id == request.schema_version
            }));
        }

        let rows = scan::apply_temporal(rows, request.temporal);

        let mut left_keys = None;
        let mut right_keys = None;
        for endpoint in &request.endpoint_filters {
            let keys = self.endpoint_keys(request, endpoint)?;
            match endpoint.side {
                EndpointSide::Left => {
                    left_keys = Some(merge_keys(left_keys, keys));
                }
                EndpointSide::Right => {
                    right_keys = Some(merge_keys(right_keys, keys));
                }
            }
        }
        Ok(scan::filter_rows(
            rows,
            request,
            left_keys.as_ref(),
            right_keys.as_ref(),
        ))
    }

    /// Resolves the entity keys matching an endpoint predicate under the
    /// outer temporal mode's view of current state.
    fn endpoint_keys(
        &self,
        request: &QueryRequest,
        endpoint: &ontic_core::query::EndpointFilter,
    ) -> Result<HashSet<String>> {
        let (descriptor, version) = match endpoint.side {
            EndpointSide::Left => (
                request.left_descriptor.clone(),
                request.left_schema_version,
            ),
            EndpointSide::Right => (
                request.right_descriptor.clone(),
                request.right_schema_version,
            ),
        };
        let descriptor = descriptor.ok_or_else(|| {
            EngineError::validation("endpoint predicate without endpoint descriptor")
        })?;
        let version = version.ok_or_else(|| {
            EngineError::metadata(format!(
                "no current schema version for endpoint type {}",
                descriptor.name
            ))
        })?;
        let mut endpoint_request = QueryRequest::latest(descriptor);
        endpoint_request.schema_version = version;
        endpoint_request.temporal = match request.temporal {
            TemporalMode::AsOf(c) => TemporalMode::AsOf(c),
            _ => TemporalMode::Latest,
        };
        endpoint_request.filter = Some(endpoint.filter.clone());
        let rows = self.collect_rows(&endpoint_request)?;
        Ok(rows
            .into_iter()
            .map(|r| match r.identity {
                ontic_core::identity::Identity::Entity { key } => key,
                ontic_core::identity::Identity::Relation { left_key, .. } => left_key,
            })
            .collect())
    }

    pub(crate) fn query_rows_impl(&self, request: &QueryRequest) -> Result<Vec<StoredRow>> {
        let rows = self.collect_rows(request)?;
        Ok(scan::order_and_page(rows, request))
    }

    pub(crate) fn aggregate_impl(
        &self,
        request: &QueryRequest,
        call: &AggregateCall,
    ) -> Result<Value> {
        if self.before_activation(request)? {
            return Ok(match call.func {
                AggFunc::Count => Value::from(0),
                _ => Value::Null,
            });
        }
        let rows = self.collect_rows(request)?;
        scan::aggregate_rows(&rows, &request.descriptor, call)
    }

    pub(crate) fn group_aggregate_impl(
        &self,
        request: &QueryRequest,
        group: &GroupByRequest,
    ) -> Result<Vec<GroupRow>> {
        let rows = self.collect_rows(request)?;
        scan::group_rows(&rows, &request.descriptor, group)
    }

    // -- Commit inspection ---------------------------------------------------

    pub(crate) fn list_commits_impl(
        &self,
        limit: u64,
        since_commit_id: Option<u64>,
    ) -> Result<Vec<CommitInfo>> {
        let (head, _) = read_head(&self.store)?;
        let Some(manifest_path) = &head.manifest_path else {
            return Ok(Vec::new());
        };
        let since = since_commit_id.unwrap_or(0);
        let mut out = Vec::new();
        walk_chain(&self.store, manifest_path, |manifest| {
            if manifest.commit_id <= since || out.len() as u64 >= limit {
                return false;
            }
            out.push(CommitInfo {
                commit_id: manifest.commit_id,
                created_at: manifest.created_at,
                runtime_id: manifest.runtime_id.clone(),
                metadata: manifest.metadata.clone(),
            });
            true
        })?;
        Ok(out)
    }

    fn manifest_for_commit(&self, commit_id: u64) -> Result<Option<Manifest>> {
        let (head, _) = read_head(&self.store)?;
        let Some(manifest_path) = &head.manifest_path else {
            return Ok(None);
        };
        if commit_id == 0 || commit_id > head.commit_id {
            return Ok(None);
        }
        let mut found = None;
        walk_chain(&self.store, manifest_path, |manifest| {
            if manifest.commit_id == commit_id {
                found = Some(manifest.clone());
                return false;
            }
            manifest.commit_id > commit_id
        })?;
        Ok(found)
    }

    pub(crate) fn get_commit_impl(&self, commit_id: u64) -> Result<Option<CommitInfo>> {
        Ok(self.manifest_for_commit(commit_id)?.map(|m| CommitInfo {
            commit_id: m.commit_id,
            created_at: m.created_at,
            runtime_id: m.runtime_id,
            metadata: m.metadata,
        }))
    }

    pub(crate) fn list_commit_changes_impl(&self, commit_id: u64) -> Result<Vec<ChangeRecord>> {
        let Some(manifest) = self.manifest_for_commit(commit_id)? else {
            return Ok(Vec::new());
        };
        let (head, _) = read_head(&self.store)?;
        let mut out = Vec::new();
        for file in &manifest.files {
            let fetched = self.store.get(&file.path)?.ok_or_else(|| {
                EngineError::metadata(format!("manifest file {} is missing", file.path))
            })?;
            let rows = parq::read_rows(file.kind, fetched.bytes)?;

            // An identity first written in this commit is an insert.
            let idx = index::resolve_index(&self.store, file.kind, &file.type_name, &head)?;
            let mut prior = HashSet::new();
            for entry in idx.entries_in_window(1, commit_id.saturating_sub(1), None) {
                if let Some(earlier) = self.store.get(&entry.path)? {
                    for row in parq::read_rows(file.kind, earlier.bytes)? {
                        if row.type_name == file.type_name && row.commit_id < commit_id {
                            prior.insert(row.identity.storage_key());
                        }
                    }
                }
            }
            for row in rows {
                if row.type_name != file.type_name {
                    continue;
                }
                let operation = if prior.contains(&row.identity.storage_key()) {
                    ChangeOp::UpdateVersion
                } else {
                    ChangeOp::Insert
                };
                out.push(ChangeRecord {
                    kind: file.kind,
                    type_name: row.type_name,
                    identity: row.identity,
                    operation,
                });
            }
        }
        Ok(out)
    }

    // -- Schema registry reads -----------------------------------------------

    pub(crate) fn stored_schema_impl(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Option<StoredSchema>> {
        let registry = self.registry_map()?;
        let Some(schema_json) = registry.get(&Self::registry_key(kind, name)) else {
            return Ok(None);
        };
        let version = self
            .type_entries()?
            .into_iter()
            .find(|t| t.kind == kind && t.name == name)
            .map(|t| t.current_version)
            .unwrap_or(0);
        Ok(Some(StoredSchema {
            kind,
            name: name.to_string(),
            version,
            schema_json: schema_json.clone(),
        }))
    }

    pub(crate) fn current_versions_impl(&self) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .type_entries()?
            .into_iter()
            .map(|t| (t.name, t.current_version))
            .collect())
    }

    pub(crate) fn schema_versions_impl(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Vec<SchemaVersionRecord>> {
        Ok(self
            .version_entries(kind, name)?
            .into_iter()
            .map(|v| SchemaVersionRecord {
                kind,
                name: name.to_string(),
                schema_version_id: v.schema_version_id,
                schema_json: v.schema_json,
                schema_hash: v.schema_hash,
                created_at: v.created_at,
                runtime_id: v.runtime_id,
                reason: v.reason,
                activation_commit: v.activation_commit,
            })
            .collect())
    }

    pub(crate) fn count_current_rows_impl(
        &self,
        kind: RecordKind,
        name: &str,
        version: i64,
    ) -> Result<u64> {
        let Some(stored) = self.stored_schema_impl(kind, name)? else {
            return Ok(0);
        };
        let descriptor = stored.descriptor()?;
        let mut request = QueryRequest::latest(descriptor);
        request.schema_version = version;
        Ok(self.collect_rows(&request)?.len() as u64)
    }
}

fn merge_keys(current: Option<HashSet<String>>, incoming: HashSet<String>) -> HashSet<String> {
    match current {
        // Multiple predicates on the same side intersect.
        Some(existing) => existing.intersection(&incoming).cloned().collect(),
        None => incoming,
    }
}

// ---------------------------------------------------------------------------
// Repository impl
// ---------------------------------------------------------------------------

impl crate::repo::Repository for ObjectRepository {
    fn engine_version(&self) -> EngineVersion {
        self.engine
    }

    fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn head(&self) -> Result<HeadInfo> {
        let (head, _) = read_head(&self.store)?;
        Ok(HeadInfo {
            commit_id: head.commit_id,
            manifest_path: head.manifest_path,
        })
    }

    fn begin_write(&self, owner_id: &str) -> Result<WriteLease> {
        lockobj::acquire(
            &self.store,
            owner_id,
            self.config.s3_lease_ttl_ms,
            self.config.s3_lock_timeout_ms,
        )
    }

    fn append_commit(&self, lease: &WriteLease, draft: CommitDraft) -> Result<u64> {
        self.append_commit_impl(lease, draft)
    }

    fn register_schemas(
        &self,
        lease: &WriteLease,
        activations: &[SchemaActivation],
    ) -> Result<()> {
        self.register_schemas_impl(lease, activations)
    }

    fn query_rows(&self, request: &QueryRequest) -> Result<Vec<StoredRow>> {
        self.query_rows_impl(request)
    }

    fn aggregate(&self, request: &QueryRequest, call: &AggregateCall) -> Result<Value> {
        self.aggregate_impl(request, call)
    }

    fn group_aggregate(
        &self,
        request: &QueryRequest,
        group: &GroupByRequest,
    ) -> Result<Vec<GroupRow>> {
        self.group_aggregate_impl(request, group)
    }

    fn list_commits(&self, limit: u64, since_commit_id: Option<u64>) -> Result<Vec<CommitInfo>> {
        self.list_commits_impl(limit, since_commit_id)
    }

    fn get_commit(&self, commit_id: u64) -> Result<Option<CommitInfo>> {
        self.get_commit_impl(commit_id)
    }

    fn list_commit_changes(&self, commit_id: u64) -> Result<Vec<ChangeRecord>> {
        self.list_commit_changes_impl(commit_id)
    }

    fn stored_schema(&self, kind: RecordKind, name: &str) -> Result<Option<StoredSchema>> {
        self.stored_schema_impl(kind, name)
    }

    fn current_versions(&self) -> Result<BTreeMap<String, i64>> {
        self.current_versions_impl()
    }

    fn schema_versions(&self, kind: RecordKind, name: &str) -> Result<Vec<SchemaVersionRecord>> {
        self.schema_versions_impl(kind, name)
    }

    fn activation_commit(
        &self,
        kind: RecordKind,
        name: &str,
        version: i64,
    ) -> Result<Option<u64>> {
        self.activation_commit_of(kind, name, version)
    }

    fn count_current_rows(&self, kind: RecordKind, name: &str, version: i64) -> Result<u64> {
        self.count_current_rows_impl(kind, name, version)
    }

    fn enqueue_events(&self, events: &[ontic_core::event::EventRecord]) -> Result<()> {
        self.enqueue_events_impl(events)
    }

    fn claim_events(
        &self,
        namespace: &str,
        handler_id: &str,
        session_id: &str,
        event_types: &[String],
        limit: usize,
        lease_ms: u64,
    ) -> Result<Vec<ontic_core::event::EventRecord>> {
        self.claim_events_impl(namespace, handler_id, session_id, event_types, limit, lease_ms)
    }

    fn ack_event(&self, handler_id: &str, event_id: &str) -> Result<()> {
        self.ack_event_impl(handler_id, event_id)
    }

    fn release_event(
        &self,
        handler_id: &str,
        event_id: &str,
        error: Option<&str>,
    ) -> Result<crate::repo::ReleaseOutcome> {
        self.release_event_impl(handler_id, event_id, error)
    }

    fn get_event(&self, event_id: &str) -> Result<Option<ontic_core::event::EventRecord>> {
        self.get_event_impl(event_id)
    }

    fn replay_event(&self, event_id: &str) -> Result<ontic_core::event::EventRecord> {
        self.replay_event_impl(event_id)
    }

    fn register_session(&self, session: &ontic_core::event::SessionRecord) -> Result<()> {
        self.register_session_impl(session)
    }

    fn heartbeat_session(&self, session_id: &str, now: chrono::DateTime<Utc>) -> Result<()> {
        self.heartbeat_session_impl(session_id, now)
    }

    fn release_session_claims(&self, session_id: &str) -> Result<u64> {
        self.release_session_claims_impl(session_id)
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        self.remove_session_impl(session_id)
    }

    fn list_dead_letters(
        &self,
        namespace: &str,
    ) -> Result<Vec<ontic_core::event::DeadLetterRecord>> {
        self.list_dead_letters_impl(namespace)
    }

    fn gc_events(&self, namespace: &str, older_than: chrono::DateTime<Utc>) -> Result<u64> {
        self.gc_events_impl(namespace, older_than)
    }

    fn compact(&self, lease: &WriteLease) -> Result<crate::repo::CompactionReport> {
        self.compact_impl(lease)
    }
}
