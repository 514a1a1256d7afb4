//! Engine configuration.

use serde::Deserialize;

/// Storage engine layout generation.
///
/// v1 stores every row in the shared history tables; v2 adds typed
/// per-`(type, schema_version)` partitions consulted by latest-state
/// reads. Existing stores keep the generation they were created with;
/// stores without engine metadata are treated as v1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineVersion {
    V1,
    V2,
}

impl EngineVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineVersion::V1 => "v1",
            EngineVersion::V2 => "v2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "v1" | "1" => Some(EngineVersion::V1),
            "v2" | "2" => Some(EngineVersion::V2),
            _ => None,
        }
    }
}

/// Engine-wide tunables. Field-level `serde(default)` lets callers
/// deserialise partial configurations from any external source.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap on change records per commit attempt.
    pub max_batch_size: usize,
    /// Derived events beyond this depth are rejected at emit.
    pub max_event_chain_depth: u32,
    /// Minimum sleep between event loop iterations.
    pub event_poll_interval_ms: u64,
    /// Per-handler claim batch size per iteration.
    pub event_claim_limit: usize,
    /// Aggregate event cap across handlers per iteration.
    pub max_events_per_iteration: usize,
    /// Lease duration for event claims.
    pub event_claim_lease_ms: u64,
    /// Terminal events older than this are eligible for GC.
    pub event_retention_ms: u64,
    /// Session heartbeat cadence.
    pub session_heartbeat_interval_ms: u64,
    /// A session is dead when its heartbeat is older than this.
    pub session_ttl_ms: u64,
    /// Dead-letter threshold per `(event, handler)`.
    pub event_max_attempts: u32,
    /// Exponential backoff base.
    pub event_backoff_base_ms: u64,
    /// Exponential backoff cap.
    pub event_backoff_max_ms: u64,
    /// Write-lock acquisition timeout for the transactional backend.
    pub lock_timeout_ms: u64,
    /// Object store region.
    pub s3_region: Option<String>,
    /// Object store endpoint override (e.g. MinIO).
    pub s3_endpoint_url: Option<String>,
    /// Write-lock acquisition timeout for the object-store backend.
    pub s3_lock_timeout_ms: u64,
    /// Write-lease TTL for the object-store backend.
    pub s3_lease_ttl_ms: u64,
    /// Per-request timeout for object store calls.
    pub s3_request_timeout_s: u64,
    /// Memory budget for the columnar scan engine.
    pub s3_duckdb_memory_limit: Option<String>,
    /// Namespace used when none is supplied.
    pub default_namespace: String,
    /// Storage layout generation for newly created stores.
    pub engine_version: EngineVersion,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
            max_event_chain_depth: 10,
            event_poll_interval_ms: 250,
            event_claim_limit: 10,
            max_events_per_iteration: 100,
            event_claim_lease_ms: 30_000,
            event_retention_ms: 7 * 24 * 60 * 60 * 1_000,
            session_heartbeat_interval_ms: 5_000,
            session_ttl_ms: 60_000,
            event_max_attempts: 5,
            event_backoff_base_ms: 1_000,
            event_backoff_max_ms: 60_000,
            lock_timeout_ms: 30_000,
            s3_region: None,
            s3_endpoint_url: None,
            s3_lock_timeout_ms: 30_000,
            s3_lease_ttl_ms: 30_000,
            s3_request_timeout_s: 30,
            s3_duckdb_memory_limit: None,
            default_namespace: "default".to_string(),
            engine_version: EngineVersion::V2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = EngineConfig::default();
        assert!(c.max_batch_size > 0);
        assert!(c.event_backoff_base_ms <= c.event_backoff_max_ms);
        assert_eq!(c.default_namespace, "default");
        assert_eq!(c.engine_version, EngineVersion::V2);
    }

    #[test]
    fn partial_deserialisation_fills_defaults() {
        let c: EngineConfig =
            serde_json::from_str(r#"{ "max_batch_size": 5, "engine_version": "v1" }"#).unwrap();
        assert_eq!(c.max_batch_size, 5);
        assert_eq!(c.engine_version, EngineVersion::V1);
        assert_eq!(c.event_max_attempts, 5);
    }
}
