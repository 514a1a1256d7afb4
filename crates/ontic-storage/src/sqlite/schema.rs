//! DDL statements for the transactional backend.
//!
//! Timestamps are stored as TEXT in ISO 8601 format (SQLite has no native
//! datetime type), booleans as INTEGER (0/1), JSON blobs as TEXT. History
//! tables are append-only; logical updates append new rows.

/// Engine metadata keys in `storage_meta`.
pub const META_ENGINE_VERSION: &str = "engine_version";
pub const META_CREATED_AT: &str = "created_at";

/// Core DDL executed when a store is opened.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // -- Commit log ----------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS commits (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at    TEXT NOT NULL,
        runtime_id    TEXT NOT NULL DEFAULT '',
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    // -- Entity history ------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS entity_history (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type       TEXT NOT NULL,
        entity_key        TEXT NOT NULL,
        fields_json       TEXT NOT NULL DEFAULT '{}',
        commit_id         INTEGER NOT NULL REFERENCES commits(id),
        schema_version_id INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_entity_history_identity
         ON entity_history(entity_type, entity_key, commit_id DESC)",
    "CREATE INDEX IF NOT EXISTS idx_entity_history_commit
         ON entity_history(commit_id)",
    // -- Relation history ----------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS relation_history (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        relation_type     TEXT NOT NULL,
        left_key          TEXT NOT NULL,
        right_key         TEXT NOT NULL,
        instance_key      TEXT NOT NULL DEFAULT '',
        fields_json       TEXT NOT NULL DEFAULT '{}',
        commit_id         INTEGER NOT NULL REFERENCES commits(id),
        schema_version_id INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_relation_history_identity
         ON relation_history(relation_type, left_key, right_key, instance_key, commit_id DESC)",
    "CREATE INDEX IF NOT EXISTS idx_relation_history_commit
         ON relation_history(commit_id)",
    // -- Schema registry -----------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS schema_registry (
        kind        TEXT NOT NULL,
        name        TEXT NOT NULL,
        schema_json TEXT NOT NULL,
        PRIMARY KEY (kind, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schema_versions (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        kind              TEXT NOT NULL,
        name              TEXT NOT NULL,
        schema_version_id INTEGER NOT NULL,
        schema_json       TEXT NOT NULL,
        schema_hash       TEXT NOT NULL,
        created_at        TEXT NOT NULL,
        runtime_id        TEXT NOT NULL DEFAULT '',
        reason            TEXT NOT NULL DEFAULT '',
        activation_commit INTEGER NOT NULL DEFAULT 0,
        UNIQUE (kind, name, schema_version_id)
    )
    "#,
    // -- Locks ---------------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        lock_name   TEXT PRIMARY KEY,
        owner_id    TEXT NOT NULL,
        acquired_at TEXT NOT NULL,
        expires_at  TEXT NOT NULL
    )
    "#,
    // -- Engine metadata -----------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS storage_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    // -- Typed layout catalog (engine v2) ------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS type_layout_catalog (
        kind              TEXT NOT NULL,
        name              TEXT NOT NULL,
        schema_version_id INTEGER NOT NULL,
        table_name        TEXT NOT NULL,
        PRIMARY KEY (kind, name)
    )
    "#,
    // -- Event bus -----------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id            TEXT PRIMARY KEY,
        namespace     TEXT NOT NULL,
        event_type    TEXT NOT NULL,
        payload       TEXT NOT NULL DEFAULT '{}',
        created_at    TEXT NOT NULL,
        priority      INTEGER NOT NULL DEFAULT 100,
        root_event_id TEXT NOT NULL,
        chain_depth   INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_claim_order
         ON events(namespace, event_type, priority DESC, created_at ASC, id ASC)",
    r#"
    CREATE TABLE IF NOT EXISTS event_claims (
        event_id         TEXT NOT NULL,
        handler_id       TEXT NOT NULL,
        session_id       TEXT NOT NULL DEFAULT '',
        claimed_at       TEXT NOT NULL,
        lease_until      TEXT NOT NULL,
        ack_at           TEXT,
        attempts         INTEGER NOT NULL DEFAULT 0,
        available_at     TEXT NOT NULL,
        last_error       TEXT,
        dead_lettered_at TEXT,
        PRIMARY KEY (event_id, handler_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_event_claims_session
         ON event_claims(session_id)",
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id         TEXT NOT NULL,
        handler_id       TEXT NOT NULL,
        namespace        TEXT NOT NULL,
        event_type       TEXT NOT NULL,
        attempts         INTEGER NOT NULL,
        last_error       TEXT,
        root_event_id    TEXT NOT NULL DEFAULT '',
        chain_depth      INTEGER NOT NULL DEFAULT 0,
        dead_lettered_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dead_letters_namespace
         ON dead_letters(namespace, dead_lettered_at)",
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id     TEXT PRIMARY KEY,
        namespace      TEXT NOT NULL,
        started_at     TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL,
        metadata       TEXT NOT NULL DEFAULT '{}'
    )
    "#,
];
