//! [`SqliteRepository`] -- the transactional backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{Duration, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ontic_core::canonical::to_canonical_json;
use ontic_core::commit::{ChangeOp, ChangeRecord, CommitDraft, CommitInfo, SchemaActivation};
use ontic_core::config::{EngineConfig, EngineVersion};
use ontic_core::descriptor::{RecordKind, TypeDescriptor};
use ontic_core::drift::{SchemaDrift, TypeDrift};
use ontic_core::error::{EngineError, Result};
use ontic_core::identity::Identity;

use crate::lease::{WRITE_LEASE_TTL_MS, WRITE_LOCK_NAME, WriteLease};
use crate::repo::{SchemaVersionRecord, StoredSchema};
use crate::sqlite::schema::{META_CREATED_AT, META_ENGINE_VERSION, SCHEMA_STATEMENTS};
use crate::sqlite::{fmt_ts, layout, parse_ts};

/// Maps a rusqlite error into the engine taxonomy.
pub(crate) fn db_err(context: &str, e: rusqlite::Error) -> EngineError {
    EngineError::storage(format!("{context}: {e}"))
}

/// SQLite-backed implementation of [`crate::repo::Repository`].
///
/// Wraps a [`rusqlite::Connection`] in a `Mutex`; writes additionally
/// serialise through the `locks` row so that multiple processes sharing
/// the database file observe one writer at a time.
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) config: EngineConfig,
    pub(crate) engine: EngineVersion,
    pub(crate) runtime_id: String,
}

impl SqliteRepository {
    /// Opens a repository from the path part of a `sqlite://` URI.
    pub fn open_uri(rest: &str, config: &EngineConfig) -> Result<Self> {
        if rest == ":memory:" || rest == "/:memory:" {
            return Self::open_in_memory(config);
        }
        let path = rest.trim_start_matches('/');
        // `sqlite:///absolute/path` keeps one leading slash.
        let path = if rest.starts_with("//") || rest.starts_with('/') {
            format!("/{path}")
        } else {
            path.to_string()
        };
        Self::open(&path, config)
    }

    /// Opens (or creates) a store at the given path.
    pub fn open(path: &str, config: &EngineConfig) -> Result<Self> {
        info!(path, "opening sqlite repository");
        let conn = Connection::open(path)
            .map_err(|e| EngineError::storage(format!("failed to open {path}: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| db_err("failed to set pragmas", e))?;
        Self::from_connection(conn, config)
    }

    /// Opens an in-memory store (tests, scratch work).
    pub fn open_in_memory(config: &EngineConfig) -> Result<Self> {
        debug!("opening in-memory sqlite repository");
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::storage(format!("failed to open in-memory db: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| db_err("failed to set pragmas", e))?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: &EngineConfig) -> Result<Self> {
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)
                .map_err(|e| db_err("schema init failed", e))?;
        }
        let engine = Self::resolve_engine_version(&conn, config)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: config.clone(),
            engine,
            runtime_id: Uuid::new_v4().to_string(),
        })
    }

    /// Reads or establishes the engine version. A store that already has
    /// commits but no engine metadata is a legacy v1 store.
    fn resolve_engine_version(conn: &Connection, config: &EngineConfig) -> Result<EngineVersion> {
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM storage_meta WHERE key = ?1",
                params![META_ENGINE_VERSION],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("engine version read failed", e))?;

        if let Some(raw) = stored {
            return EngineVersion::parse(&raw).ok_or_else(|| {
                EngineError::metadata(format!("unknown engine version `{raw}` in storage_meta"))
            });
        }

        let has_commits: i64 = conn
            .query_row("SELECT COUNT(*) FROM commits", [], |r| r.get(0))
            .map_err(|e| db_err("commit count failed", e))?;
        let engine = if has_commits > 0 {
            debug!("no engine metadata on a non-empty store; treating as legacy v1");
            EngineVersion::V1
        } else {
            config.engine_version
        };
        conn.execute(
            "INSERT OR IGNORE INTO storage_meta (key, value) VALUES (?1, ?2), (?3, ?4)",
            params![
                META_ENGINE_VERSION,
                engine.as_str(),
                META_CREATED_AT,
                fmt_ts(&Utc::now())
            ],
        )
        .map_err(|e| db_err("engine version write failed", e))?;
        Ok(engine)
    }

    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::storage(format!("connection mutex poisoned: {e}")))
    }

    // -- Head ----------------------------------------------------------------

    pub(crate) fn head_commit_id(conn: &Connection) -> Result<u64> {
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM commits", [], |r| {
            r.get::<_, i64>(0)
        })
        .map(|v| v as u64)
        .map_err(|e| db_err("head read failed", e))
    }

    // -- Write lock ----------------------------------------------------------

    /// Acquires the write lock row, retrying with jittered backoff until
    /// `lock_timeout_ms`. An expired lock is taken over in place.
    pub(crate) fn begin_write_impl(&self, owner_id: &str) -> Result<WriteLease> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match self.try_acquire_lock(owner_id)? {
                None => {
                    let conn = Arc::clone(&self.conn);
                    let owner = owner_id.to_string();
                    let release = Box::new(move || {
                        if let Ok(conn) = conn.lock() {
                            let _ = conn.execute(
                                "DELETE FROM locks WHERE lock_name = ?1 AND owner_id = ?2",
                                params![WRITE_LOCK_NAME, owner],
                            );
                        }
                    });
                    return Ok(WriteLease::new(owner_id, WRITE_LEASE_TTL_MS, release));
                }
                Some(holder) => {
                    if started.elapsed().as_millis() as u64 >= self.config.lock_timeout_ms {
                        return Err(EngineError::LockContention {
                            lock: WRITE_LOCK_NAME.to_string(),
                            holder,
                        });
                    }
                    attempt += 1;
                    let base = 20u64.saturating_mul(u64::from(attempt.min(8)));
                    let jitter = rand::thread_rng().gen_range(0..25);
                    std::thread::sleep(std::time::Duration::from_millis(base + jitter));
                }
            }
        }
    }

    /// One acquisition attempt; returns the current holder when contended.
    fn try_acquire_lock(&self, owner_id: &str) -> Result<Option<String>> {
        let mut guard = self.lock_conn()?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("lock transaction failed", e))?;
        let now = Utc::now();
        let expires = now + Duration::milliseconds(WRITE_LEASE_TTL_MS as i64);

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT owner_id, expires_at FROM locks WHERE lock_name = ?1",
                params![WRITE_LOCK_NAME],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| db_err("lock read failed", e))?;

        match current {
            None => {
                tx.execute(
                    "INSERT INTO locks (lock_name, owner_id, acquired_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![WRITE_LOCK_NAME, owner_id, fmt_ts(&now), fmt_ts(&expires)],
                )
                .map_err(|e| db_err("lock insert failed", e))?;
            }
            Some((holder, expires_at_raw)) => {
                let holder_expired = parse_ts(&expires_at_raw)
                    .map(|exp| exp <= now)
                    .unwrap_or(true);
                if holder != owner_id && !holder_expired {
                    return Ok(Some(holder));
                }
                if holder_expired && holder != owner_id {
                    warn!(holder, "taking over expired write lock");
                }
                tx.execute(
                    "UPDATE locks SET owner_id = ?2, acquired_at = ?3, expires_at = ?4
                     WHERE lock_name = ?1 AND owner_id = ?5 AND expires_at = ?6",
                    params![
                        WRITE_LOCK_NAME,
                        owner_id,
                        fmt_ts(&now),
                        fmt_ts(&expires),
                        holder,
                        expires_at_raw
                    ],
                )
                .map_err(|e| db_err("lock takeover failed", e))?;
            }
        }
        tx.commit().map_err(|e| db_err("lock commit failed", e))?;
        Ok(None)
    }

    /// Verifies that the lease still owns an unexpired lock row.
    fn verify_lock(conn: &Connection, lease: &WriteLease) -> Result<()> {
        let now = Utc::now();
        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT owner_id, expires_at FROM locks WHERE lock_name = ?1",
                params![WRITE_LOCK_NAME],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| db_err("lock verify failed", e))?;
        match current {
            Some((owner, expires_at)) if owner == lease.owner_id() => {
                if parse_ts(&expires_at)? <= now {
                    Err(EngineError::LeaseExpired {
                        owner: owner.clone(),
                    })
                } else {
                    Ok(())
                }
            }
            _ => Err(EngineError::LeaseExpired {
                owner: lease.owner_id().to_string(),
            }),
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

        let mut guard = self.lock_conn()?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("commit transaction failed", e))?;

        Self::verify_lock(&tx, lease)?;
        Self::check_expected_versions(&tx, &draft.expected_versions)?;

        let now = Utc::now();
        let metadata_json = serde_json::to_string(&draft.metadata)?;
        tx.execute(
            "INSERT INTO commits (created_at, runtime_id, metadata_json) VALUES (?1, ?2, ?3)",
            params![fmt_ts(&now), self.runtime_id, metadata_json],
        )
        .map_err(|e| db_err("commit insert failed", e))?;
        let commit_id = tx.last_insert_rowid() as u64;

        // Activations first: migrations write rows under the version they
        // activate, so partitions must exist before the row writes.
        Self::apply_activations(
            &tx,
            &draft.schema_activations,
            commit_id,
            &self.runtime_id,
            self.engine,
        )?;

        for change in &draft.changes {
            let fields_json = to_canonical_json(&change.payload);
            match (&change.record.kind, &change.record.identity) {
                (RecordKind::Entity, Identity::Entity { key }) => {
                    tx.execute(
                        "INSERT INTO entity_history
                             (entity_type, entity_key, fields_json, commit_id, schema_version_id)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            change.record.type_name,
                            key,
                            fields_json,
                            commit_id as i64,
                            change.schema_version_id
                        ],
                    )
                    .map_err(|e| db_err("entity history insert failed", e))?;
                }
                (RecordKind::Relation, Identity::Relation { left_key, right_key, instance_key }) => {
                    tx.execute(
                        "INSERT INTO relation_history
                             (relation_type, left_key, right_key, instance_key, fields_json,
                              commit_id, schema_version_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            change.record.type_name,
                            left_key,
                            right_key,
                            instance_key,
                            fields_json,
                            commit_id as i64,
                            change.schema_version_id
                        ],
                    )
                    .map_err(|e| db_err("relation history insert failed", e))?;
                }
                _ => {
                    return Err(EngineError::validation(format!(
                        "change kind does not match identity for {}",
                        change.record.type_name
                    )));
                }
            }

            if self.engine == EngineVersion::V2 {
                let descriptor =
                    Self::descriptor_for(&tx, change.record.kind, &change.record.type_name)?;
                layout::upsert_partition_row(
                    &tx,
                    &descriptor,
                    change.schema_version_id,
                    &change.record.identity,
                    &fields_json,
                    &change.payload,
                    commit_id,
                )?;
            }
        }

        // Guard once more right before making the commit durable.
        lease.guard(Utc::now())?;
        tx.commit().map_err(|e| db_err("commit failed", e))?;
        debug!(commit_id, changes = draft.changes.len(), "commit appended");
        Ok(commit_id)
    }

    fn check_expected_versions(
        conn: &Connection,
        expected: &BTreeMap<String, i64>,
    ) -> Result<()> {
        let mut drifted = Vec::new();
        for (type_name, expected_version) in expected {
            let stored: Option<i64> = conn
                .query_row(
                    "SELECT MAX(schema_version_id) FROM schema_versions WHERE name = ?1",
                    params![type_name],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| db_err("schema version read failed", e))?
                .flatten();
            if stored != Some(*expected_version) {
                drifted.push(TypeDrift {
                    kind: None,
                    type_name: type_name.clone(),
                    stored_version: stored,
                    changed: Vec::new(),
                    added: Vec::new(),
                    removed: Vec::new(),
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

    fn apply_activations(
        conn: &Connection,
        activations: &[SchemaActivation],
        activation_commit: u64,
        runtime_id: &str,
        engine: EngineVersion,
    ) -> Result<()> {
        for activation in activations {
            let schema_json = to_canonical_json(&activation.schema_json);
            conn.execute(
                "INSERT OR IGNORE INTO schema_versions
                     (kind, name, schema_version_id, schema_json, schema_hash,
                      created_at, runtime_id, reason, activation_commit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    activation.kind.as_str(),
                    activation.type_name,
                    activation.schema_version_id,
                    schema_json,
                    activation.schema_hash,
                    fmt_ts(&Utc::now()),
                    runtime_id,
                    activation.reason,
                    activation_commit as i64
                ],
            )
            .map_err(|e| db_err("schema version insert failed", e))?;
            conn.execute(
                "INSERT INTO schema_registry (kind, name, schema_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(kind, name) DO UPDATE SET schema_json = excluded.schema_json",
                params![activation.kind.as_str(), activation.type_name, schema_json],
            )
            .map_err(|e| db_err("schema registry upsert failed", e))?;

            if engine == EngineVersion::V2 {
                let descriptor = TypeDescriptor::from_registry_json(&activation.schema_json)?;
                for stmt in layout::partition_ddl(&descriptor, activation.schema_version_id) {
                    conn.execute_batch(&stmt)
                        .map_err(|e| db_err("partition create failed", e))?;
                }
                conn.execute(
                    "INSERT INTO type_layout_catalog (kind, name, schema_version_id, table_name)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(kind, name) DO UPDATE SET
                         schema_version_id = excluded.schema_version_id,
                         table_name = excluded.table_name",
                    params![
                        activation.kind.as_str(),
                        activation.type_name,
                        activation.schema_version_id,
                        layout::partition_table_name(
                            activation.kind,
                            &activation.type_name,
                            activation.schema_version_id
                        )
                    ],
                )
                .map_err(|e| db_err("layout catalog upsert failed", e))?;
            }
        }
        Ok(())
    }

    pub(crate) fn register_schemas_impl(
        &self,
        lease: &WriteLease,
        activations: &[SchemaActivation],
    ) -> Result<()> {
        lease.guard(Utc::now())?;
        let mut guard = self.lock_conn()?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("registration transaction failed", e))?;
        Self::verify_lock(&tx, lease)?;
        let head = Self::head_commit_id(&tx)?;
        Self::apply_activations(&tx, activations, head, &self.runtime_id, self.engine)?;
        tx.commit().map_err(|e| db_err("registration commit failed", e))?;
        Ok(())
    }

    fn descriptor_for(
        conn: &Connection,
        kind: RecordKind,
        type_name: &str,
    ) -> Result<TypeDescriptor> {
        let schema_json: String = conn
            .query_row(
                "SELECT schema_json FROM schema_registry WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), type_name],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("registry read failed", e))?
            .ok_or_else(|| {
                EngineError::metadata(format!("type {type_name} is not registered"))
            })?;
        TypeDescriptor::from_registry_json(&serde_json::from_str(&schema_json)?)
    }

    // -- Commit inspection ---------------------------------------------------

    pub(crate) fn list_commits_impl(
        &self,
        limit: u64,
        since_commit_id: Option<u64>,
    ) -> Result<Vec<CommitInfo>> {
        let conn = self.lock_conn()?;
        let since = since_commit_id.unwrap_or(0) as i64;
        let mut stmt = conn
            .prepare(
                "SELECT id, created_at, runtime_id, metadata_json FROM commits
                 WHERE id > ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| db_err("list commits failed", e))?;
        let rows = stmt
            .query_map(params![since, limit as i64], scan_commit)
            .map_err(|e| db_err("list commits failed", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| db_err("commit scan failed", e))??);
        }
        Ok(out)
    }

    pub(crate) fn get_commit_impl(&self, commit_id: u64) -> Result<Option<CommitInfo>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, created_at, runtime_id, metadata_json FROM commits WHERE id = ?1",
            params![commit_id as i64],
            scan_commit,
        )
        .optional()
        .map_err(|e| db_err("get commit failed", e))?
        .transpose()
    }

    pub(crate) fn list_commit_changes_impl(&self, commit_id: u64) -> Result<Vec<ChangeRecord>> {
        let conn = self.lock_conn()?;
        let mut out = Vec::new();

        let mut stmt = conn
            .prepare(
                "SELECT h.entity_type, h.entity_key,
                        NOT EXISTS (SELECT 1 FROM entity_history p
                                    WHERE p.entity_type = h.entity_type
                                      AND p.entity_key = h.entity_key
                                      AND p.commit_id < h.commit_id)
                 FROM entity_history h WHERE h.commit_id = ?1
                 ORDER BY h.entity_type, h.entity_key",
            )
            .map_err(|e| db_err("commit changes failed", e))?;
        let rows = stmt
            .query_map(params![commit_id as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, bool>(2)?,
                ))
            })
            .map_err(|e| db_err("commit changes failed", e))?;
        for row in rows {
            let (type_name, key, is_insert) = row.map_err(|e| db_err("change scan failed", e))?;
            out.push(ChangeRecord {
                kind: RecordKind::Entity,
                type_name,
                identity: Identity::Entity { key },
                operation: if is_insert {
                    ChangeOp::Insert
                } else {
                    ChangeOp::UpdateVersion
                },
            });
        }

        let mut stmt = conn
            .prepare(
                "SELECT h.relation_type, h.left_key, h.right_key, h.instance_key,
                        NOT EXISTS (SELECT 1 FROM relation_history p
                                    WHERE p.relation_type = h.relation_type
                                      AND p.left_key = h.left_key
                                      AND p.right_key = h.right_key
                                      AND p.instance_key = h.instance_key
                                      AND p.commit_id < h.commit_id)
                 FROM relation_history h WHERE h.commit_id = ?1
                 ORDER BY h.relation_type, h.left_key, h.right_key, h.instance_key",
            )
            .map_err(|e| db_err("commit changes failed", e))?;
        let rows = stmt
            .query_map(params![commit_id as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, bool>(4)?,
                ))
            })
            .map_err(|e| db_err("commit changes failed", e))?;
        for row in rows {
            let (type_name, left_key, right_key, instance_key, is_insert) =
                row.map_err(|e| db_err("change scan failed", e))?;
            out.push(ChangeRecord {
                kind: RecordKind::Relation,
                type_name,
                identity: Identity::Relation {
                    left_key,
                    right_key,
                    instance_key,
                },
                operation: if is_insert {
                    ChangeOp::Insert
                } else {
                    ChangeOp::UpdateVersion
                },
            });
        }
        Ok(out)
    }

    // -- Schema registry reads -----------------------------------------------

    pub(crate) fn stored_schema_impl(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Option<StoredSchema>> {
        let conn = self.lock_conn()?;
        let schema_json: Option<String> = conn
            .query_row(
                "SELECT schema_json FROM schema_registry WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("registry read failed", e))?;
        let Some(schema_json) = schema_json else {
            return Ok(None);
        };
        let version: Option<i64> = conn
            .query_row(
                "SELECT MAX(schema_version_id) FROM schema_versions WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("schema version read failed", e))?
            .flatten();
        Ok(Some(StoredSchema {
            kind,
            name: name.to_string(),
            version: version.unwrap_or(0),
            schema_json: serde_json::from_str(&schema_json)?,
        }))
    }

    pub(crate) fn current_versions_impl(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT name, MAX(schema_version_id) FROM schema_versions GROUP BY name")
            .map_err(|e| db_err("versions read failed", e))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(|e| db_err("versions read failed", e))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (name, version) = row.map_err(|e| db_err("versions scan failed", e))?;
            out.insert(name, version);
        }
        Ok(out)
    }

    pub(crate) fn schema_versions_impl(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Vec<SchemaVersionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT schema_version_id, schema_json, schema_hash, created_at,
                        runtime_id, reason, activation_commit
                 FROM schema_versions WHERE kind = ?1 AND name = ?2
                 ORDER BY schema_version_id ASC",
            )
            .map_err(|e| db_err("schema versions failed", e))?;
        let rows = stmt
            .query_map(params![kind.as_str(), name], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, i64>(6)?,
                ))
            })
            .map_err(|e| db_err("schema versions failed", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (version, schema_json, schema_hash, created_at, runtime_id, reason, activation) =
                row.map_err(|e| db_err("schema version scan failed", e))?;
            out.push(SchemaVersionRecord {
                kind,
                name: name.to_string(),
                schema_version_id: version,
                schema_json: serde_json::from_str(&schema_json)?,
                schema_hash,
                created_at: parse_ts(&created_at)?,
                runtime_id,
                reason,
                activation_commit: activation as u64,
            });
        }
        Ok(out)
    }

    pub(crate) fn activation_commit_impl(
        &self,
        kind: RecordKind,
        name: &str,
        version: i64,
    ) -> Result<Option<u64>> {
        let conn = self.lock_conn()?;
        let activation: Option<i64> = conn
            .query_row(
                "SELECT activation_commit FROM schema_versions
                 WHERE kind = ?1 AND name = ?2 AND schema_version_id = ?3",
                params![kind.as_str(), name, version],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("activation read failed", e))?;
        Ok(activation.map(|v| v as u64))
    }
}

fn scan_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<CommitInfo>> {
    let id: i64 = row.get(0)?;
    let created_at: String = row.get(1)?;
    let runtime_id: String = row.get(2)?;
    let metadata_json: String = row.get(3)?;
    Ok((|| {
        Ok(CommitInfo {
            commit_id: id as u64,
            created_at: parse_ts(&created_at)?,
            runtime_id,
            metadata: serde_json::from_str(&metadata_json)?,
        })
    })())
}

// ---------------------------------------------------------------------------
// Repository impl
// ---------------------------------------------------------------------------

impl crate::repo::Repository for SqliteRepository {
    fn engine_version(&self) -> EngineVersion {
        self.engine
    }

    fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn head(&self) -> Result<crate::repo::HeadInfo> {
        let conn = self.lock_conn()?;
        Ok(crate::repo::HeadInfo {
            commit_id: Self::head_commit_id(&conn)?,
            manifest_path: None,
        })
    }

    fn begin_write(&self, owner_id: &str) -> Result<WriteLease> {
        self.begin_write_impl(owner_id)
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

    fn query_rows(
        &self,
        request: &ontic_core::query::QueryRequest,
    ) -> Result<Vec<ontic_core::row::StoredRow>> {
        self.query_rows_impl(request)
    }

    fn aggregate(
        &self,
        request: &ontic_core::query::QueryRequest,
        call: &ontic_core::query::AggregateCall,
    ) -> Result<serde_json::Value> {
        self.aggregate_impl(request, call)
    }

    fn group_aggregate(
        &self,
        request: &ontic_core::query::QueryRequest,
        group: &ontic_core::query::GroupByRequest,
    ) -> Result<Vec<ontic_core::query::GroupRow>> {
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
        self.activation_commit_impl(kind, name, version)
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
}
