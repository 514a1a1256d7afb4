//! The session façade.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ontic_core::commit::{ChangeRecord, CommitDraft, CommitInfo, SchemaActivation};
use ontic_core::config::EngineConfig;
use ontic_core::descriptor::TypeDescriptor;
use ontic_core::drift::{SchemaDrift, diff_against_stored_fields};
use ontic_core::error::{EngineError, Result};
use ontic_core::event::EventDraft;
use ontic_core::intent::{EntityType, Intent, RelationType};
use ontic_bus::{Handler, Schedule, run_loop};
use ontic_query::Query;
use ontic_storage::{Repository, open_repository};

use crate::context::HandlerContext;
use crate::migrate::{MigrationReport, MigrationRequest, run_migration};
use crate::reconcile::reconcile;

/// Construction options for a [`Session`].
pub struct SessionOptions {
    /// Event namespace; `None` uses the configured default.
    pub namespace: Option<String>,
    /// Entity descriptors this session works with.
    pub entity_types: Vec<TypeDescriptor>,
    /// Relation descriptors this session works with.
    pub relation_types: Vec<TypeDescriptor>,
    /// Metadata stamped into every commit from this session.
    pub instance_metadata: BTreeMap<String, String>,
    pub config: EngineConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            entity_types: Vec::new(),
            relation_types: Vec::new(),
            instance_metadata: BTreeMap::new(),
            config: EngineConfig::default(),
        }
    }
}

/// A handler registered with [`Session::run`].
///
/// Explicit registry entry: event type, dispatch priority (higher runs
/// earlier) and the callable.
pub struct SessionHandler {
    pub id: String,
    pub event_type: String,
    pub priority: i32,
    #[allow(clippy::type_complexity)]
    pub func: Box<dyn for<'a> Fn(&mut HandlerContext<'a>) -> Result<()> + Send + Sync>,
}

impl SessionHandler {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        priority: i32,
        func: impl for<'a> Fn(&mut HandlerContext<'a>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            priority,
            func: Box::new(func),
        }
    }
}

/// A working session over one repository.
///
/// Owns the FIFO intent queue and a cache of current schema versions.
/// Commits reconcile the queued intents against current state under the
/// write lease; an unchanged payload produces no commit at all.
pub struct Session {
    repo: Box<dyn Repository>,
    session_id: String,
    namespace: String,
    config: EngineConfig,
    descriptors: BTreeMap<String, TypeDescriptor>,
    versions: Mutex<BTreeMap<String, i64>>,
    queue: Mutex<Vec<Intent>>,
    instance_metadata: BTreeMap<String, String>,
    stop: Arc<AtomicBool>,
}

impl Session {
    /// Opens a session over the repository at `uri`.
    pub fn new(uri: &str, options: SessionOptions) -> Result<Self> {
        let repo = open_repository(uri, &options.config)?;
        let namespace = options
            .namespace
            .unwrap_or_else(|| options.config.default_namespace.clone());

        let mut descriptors = BTreeMap::new();
        for descriptor in options
            .entity_types
            .into_iter()
            .chain(options.relation_types)
        {
            if descriptors
                .insert(descriptor.name.clone(), descriptor)
                .is_some()
            {
                return Err(EngineError::validation(
                    "duplicate type name registered with session",
                ));
            }
        }

        let session_id = Uuid::new_v4().to_string();
        info!(session_id, namespace, "session opened");
        Ok(Self {
            config: options.config,
            repo,
            session_id,
            namespace,
            descriptors,
            versions: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(Vec::new()),
            instance_metadata: options.instance_metadata,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repo(&self) -> &dyn Repository {
        self.repo.as_ref()
    }

    pub(crate) fn descriptors(&self) -> &BTreeMap<String, TypeDescriptor> {
        &self.descriptors
    }

    pub(crate) fn cached_versions(&self) -> BTreeMap<String, i64> {
        self.versions.lock().map(|v| v.clone()).unwrap_or_default()
    }

    // -- Intents -------------------------------------------------------------

    /// Queues an entity intent.
    pub fn ensure_entity<E: EntityType>(&self, value: &E) -> Result<()> {
        self.push_intent(Intent::from_entity(value)?)
    }

    /// Queues a relation intent.
    pub fn ensure_relation<R: RelationType>(&self, value: &R) -> Result<()> {
        self.push_intent(Intent::from_relation(value)?)
    }

    /// Queues pre-built intents (mixed kinds allowed; empty is a no-op).
    pub fn ensure_intents(&self, intents: impl IntoIterator<Item = Intent>) -> Result<()> {
        for intent in intents {
            self.push_intent(intent)?;
        }
        Ok(())
    }

    fn push_intent(&self, intent: Intent) -> Result<()> {
        if !self.descriptors.contains_key(&intent.type_name) {
            return Err(EngineError::validation(format!(
                "type {} is not registered with this session",
                intent.type_name
            )));
        }
        self.queue
            .lock()
            .map_err(|e| EngineError::storage(format!("intent queue poisoned: {e}")))?
            .push(intent);
        Ok(())
    }

    /// Number of queued intents.
    pub fn pending_intents(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    // -- Validation ----------------------------------------------------------

    /// Compares the registered descriptors against the stored schema.
    ///
    /// Types never stored before are registered (version 1). A stored
    /// type whose fields drifted raises [`EngineError::SchemaOutdated`]
    /// with the structured diff; resolving it requires a migration.
    /// Current version ids are cached for the commit drift check.
    pub fn validate(&self) -> Result<()> {
        let mut drift = SchemaDrift::default();
        let mut to_register = Vec::new();
        let mut versions = BTreeMap::new();

        for descriptor in self.descriptors.values() {
            match self.repo.stored_schema(descriptor.kind, &descriptor.name)? {
                None => {
                    to_register.push(SchemaActivation {
                        kind: descriptor.kind,
                        type_name: descriptor.name.clone(),
                        schema_version_id: 1,
                        schema_json: descriptor.to_registry_json()?,
                        schema_hash: schema_hash(descriptor)?,
                        reason: "initial registration".to_string(),
                    });
                    versions.insert(descriptor.name.clone(), 1);
                }
                Some(stored) => {
                    let type_drift = diff_against_stored_fields(
                        descriptor,
                        &stored.stored_fields(),
                        Some(stored.version),
                    );
                    if !type_drift.is_empty() {
                        drift.types.push(type_drift);
                    }
                    versions.insert(descriptor.name.clone(), stored.version);
                }
            }
        }

        if !drift.is_empty() {
            return Err(EngineError::SchemaOutdated { drift });
        }

        if !to_register.is_empty() {
            debug!(count = to_register.len(), "registering new types");
            let lease = self.repo.begin_write(&self.session_id)?;
            self.repo.register_schemas(&lease, &to_register)?;
            drop(lease);
        }

        *self
            .versions
            .lock()
            .map_err(|e| EngineError::storage(format!("version cache poisoned: {e}")))? = versions;
        Ok(())
    }

    fn ensure_validated(&self) -> Result<()> {
        let empty = self
            .versions
            .lock()
            .map(|v| v.is_empty())
            .unwrap_or(true);
        if empty && !self.descriptors.is_empty() {
            self.validate()?;
        }
        Ok(())
    }

    // -- Commit --------------------------------------------------------------

    /// Reconciles the queued intents and persists a commit.
    ///
    /// Returns `None` when the delta is empty (the optional event is
    /// still enqueued). The queue is drained either way; a failed commit
    /// discards it.
    pub fn commit(&self, event: Option<EventDraft>) -> Result<Option<u64>> {
        self.ensure_validated()?;
        let intents: Vec<Intent> = {
            let mut queue = self
                .queue
                .lock()
                .map_err(|e| EngineError::storage(format!("intent queue poisoned: {e}")))?;
            queue.drain(..).collect()
        };
        self.commit_intents(intents, event)
    }

    /// Commit path shared with handler contexts.
    pub(crate) fn commit_intents(
        &self,
        intents: Vec<Intent>,
        event: Option<EventDraft>,
    ) -> Result<Option<u64>> {
        if intents.is_empty() {
            // Event-only: no lease, no commit row.
            if let Some(event) = event {
                self.enqueue_root(event)?;
            }
            return Ok(None);
        }

        let versions = self.cached_versions();
        let lease = self.repo.begin_write(&self.session_id)?;
        let changes = reconcile(
            self.repo.as_ref(),
            &self.descriptors,
            &versions,
            intents,
            self.config.max_batch_size,
        )?;
        if changes.is_empty() {
            drop(lease);
            if let Some(event) = event {
                self.enqueue_root(event)?;
            }
            return Ok(None);
        }

        let mut expected_versions = BTreeMap::new();
        for change in &changes {
            let version = versions
                .get(&change.record.type_name)
                .copied()
                .unwrap_or(change.schema_version_id);
            expected_versions.insert(change.record.type_name.clone(), version);
        }
        let draft = CommitDraft {
            changes,
            metadata: self.instance_metadata.clone(),
            expected_versions,
            schema_activations: Vec::new(),
        };
        let commit_id = self.repo.append_commit(&lease, draft)?;
        drop(lease);

        if let Some(event) = event {
            self.enqueue_root(event)?;
        }
        debug!(commit_id, "session commit");
        Ok(Some(commit_id))
    }

    pub(crate) fn enqueue_root(&self, draft: EventDraft) -> Result<()> {
        let event = draft.into_root_event(&self.namespace, Utc::now());
        self.repo.enqueue_events(std::slice::from_ref(&event))
    }

    // -- Queries -------------------------------------------------------------

    /// Typed query surface bound to the cached schema versions.
    pub fn query(&self) -> Result<Query<'_>> {
        self.ensure_validated()?;
        Ok(Query::new(self.repo.as_ref(), self.cached_versions()))
    }

    // -- Commit inspection ---------------------------------------------------

    pub fn list_commits(
        &self,
        limit: u64,
        since_commit_id: Option<u64>,
    ) -> Result<Vec<CommitInfo>> {
        self.repo.list_commits(limit, since_commit_id)
    }

    pub fn get_commit(&self, commit_id: u64) -> Result<Option<CommitInfo>> {
        self.repo.get_commit(commit_id)
    }

    pub fn list_commit_changes(&self, commit_id: u64) -> Result<Vec<ChangeRecord>> {
        self.repo.list_commit_changes(commit_id)
    }

    // -- Migration -----------------------------------------------------------

    /// Previews or applies a schema migration (see [`MigrationRequest`]).
    pub fn migrate(&self, request: MigrationRequest<'_>) -> Result<MigrationReport> {
        let report = run_migration(self, request)?;
        if report.applied {
            // Refresh the version cache against the new registry state.
            self.validate()?;
        }
        Ok(report)
    }

    // -- Event loop ----------------------------------------------------------

    /// Enqueues an event outside any commit (imperative emission).
    pub fn enqueue(&self, draft: EventDraft) -> Result<()> {
        self.enqueue_root(draft)
    }

    /// Runs the reactive loop until [`Session::stop`] or
    /// `max_iterations`.
    pub fn run(
        &self,
        handlers: Vec<SessionHandler>,
        schedules: Vec<Schedule>,
        max_iterations: Option<u64>,
    ) -> Result<ontic_bus::LoopReport> {
        self.ensure_validated()?;
        self.stop.store(false, Ordering::SeqCst);

        let wrapped: Vec<Handler<HandlerContext<'_>>> = handlers
            .into_iter()
            .map(|h| {
                let func = h.func;
                Handler::new(h.id, h.event_type, h.priority, move |ctx: &mut HandlerContext<'_>| {
                    func(ctx)
                })
            })
            .collect();

        run_loop(
            self.repo.as_ref(),
            &self.config,
            &self.namespace,
            &self.session_id,
            wrapped,
            schedules,
            &self.stop,
            max_iterations,
            |event, lease_until| HandlerContext::new(self, event.clone(), lease_until),
        )
    }

    /// Requests a graceful stop of a running loop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Removes terminal events older than the retention window.
    pub fn gc_events(&self) -> Result<u64> {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(self.config.event_retention_ms as i64);
        self.repo.gc_events(&self.namespace, cutoff)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let pending = self.pending_intents();
        if pending > 0 {
            warn!(
                session_id = %self.session_id,
                pending,
                "session dropped with uncommitted intents"
            );
        }
    }
}

pub(crate) fn schema_hash(descriptor: &TypeDescriptor) -> Result<String> {
    Ok(ontic_core::canonical::canonical_hash(
        &descriptor.to_registry_json()?,
    ))
}
