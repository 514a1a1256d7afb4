//! Object key layout under the repository prefix.

use ontic_core::config::EngineVersion;
use ontic_core::descriptor::RecordKind;

pub(crate) const HEAD: &str = "meta/head.json";
pub(crate) const LOCK: &str = "meta/locks/ontology_write.json";
pub(crate) const REGISTRY: &str = "meta/schema/registry.json";
pub(crate) const TYPES: &str = "meta/schema/types.json";
pub(crate) const META_ENGINE: &str = "meta/engine.json";

/// `meta/schema/versions/<kind>/<name>.json`
pub(crate) fn versions_path(kind: RecordKind, name: &str) -> String {
    format!("meta/schema/versions/{}/{name}.json", kind.as_str())
}

/// `meta/indices/<kind>/<name>.json`
pub(crate) fn index_path(kind: RecordKind, name: &str) -> String {
    format!("meta/indices/{}/{name}.json", kind.as_str())
}

/// `commits/<cid>-<attempt>/` prefix.
pub(crate) fn attempt_prefix(commit_id: u64, attempt: &str) -> String {
    format!("commits/{commit_id}-{attempt}")
}

/// Manifest path of an attempt.
pub(crate) fn manifest_path(commit_id: u64, attempt: &str) -> String {
    format!("{}/manifest.json", attempt_prefix(commit_id, attempt))
}

/// Data file path of a type inside an attempt. Engine v2 partitions per
/// schema version.
pub(crate) fn data_path(
    commit_id: u64,
    attempt: &str,
    kind: RecordKind,
    type_name: &str,
    schema_version: i64,
    engine: EngineVersion,
) -> String {
    let group = match kind {
        RecordKind::Entity => "entities",
        RecordKind::Relation => "relations",
    };
    match engine {
        EngineVersion::V1 => format!(
            "{}/{group}/{type_name}.parquet",
            attempt_prefix(commit_id, attempt)
        ),
        EngineVersion::V2 => format!(
            "{}/{group}/{type_name}/v{schema_version}.parquet",
            attempt_prefix(commit_id, attempt)
        ),
    }
}

/// Snapshot file path produced by compaction.
pub(crate) fn snapshot_path(
    kind: RecordKind,
    type_name: &str,
    min_commit: u64,
    max_commit: u64,
) -> String {
    let group = match kind {
        RecordKind::Entity => "entities",
        RecordKind::Relation => "relations",
    };
    format!("snapshots/{group}/{type_name}-{min_commit}-{max_commit}.parquet")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_data_paths_partition_by_version() {
        let v1 = data_path(3, "ab12cd34", RecordKind::Entity, "Customer", 2, EngineVersion::V1);
        assert_eq!(v1, "commits/3-ab12cd34/entities/Customer.parquet");
        let v2 = data_path(3, "ab12cd34", RecordKind::Entity, "Customer", 2, EngineVersion::V2);
        assert_eq!(v2, "commits/3-ab12cd34/entities/Customer/v2.parquet");
    }

    #[test]
    fn snapshot_paths_carry_commit_range() {
        assert_eq!(
            snapshot_path(RecordKind::Relation, "Employment", 2, 9),
            "snapshots/relations/Employment-2-9.parquet"
        );
    }
}
