//! Commit manifests and the head object.
//!
//! The linked list of manifests via `parent_manifest_path` is the
//! authoritative commit chain and audit trail; `meta/head.json` points at
//! its newest element. Everything else (indices, registry mirrors) is
//! advisory and repairable from here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ontic_core::commit::SchemaActivation;
use ontic_core::descriptor::RecordKind;
use ontic_core::error::{EngineError, Result};

use crate::s3::Store;
use crate::s3::layout;

/// `meta/head.json`: the sole authoritative head pointer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct HeadObject {
    pub commit_id: u64,
    /// Path of the head commit's manifest; `None` on an empty store.
    pub manifest_path: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub runtime_id: String,
}

impl HeadObject {
    pub(crate) fn empty(runtime_id: &str) -> Self {
        Self {
            commit_id: 0,
            manifest_path: None,
            updated_at: Utc::now(),
            runtime_id: runtime_id.to_string(),
        }
    }
}

/// One data file referenced by a manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ManifestFile {
    pub kind: RecordKind,
    pub type_name: String,
    pub path: String,
    pub row_count: u64,
    pub schema_version_id: i64,
    pub content_sha256: String,
}

/// `commits/<cid>-<attempt>/manifest.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub commit_id: u64,
    pub parent_commit_id: u64,
    /// Manifest path of the parent commit; `None` for the first commit.
    pub parent_manifest_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub runtime_id: String,
    pub metadata: BTreeMap<String, String>,
    pub files: Vec<ManifestFile>,
    /// Schema versions activated atomically with this commit.
    #[serde(default)]
    pub schema_activations: Vec<SchemaActivation>,
}

/// Reads the head object with its etag; absent head means empty store.
pub(crate) fn read_head(store: &Store) -> Result<(HeadObject, Option<String>)> {
    match store.get_json::<HeadObject>(layout::HEAD)? {
        Some((head, e_tag)) => Ok((head, e_tag)),
        None => Ok((HeadObject::empty(""), None)),
    }
}

/// Loads one manifest by path.
pub(crate) fn read_manifest(store: &Store, path: &str) -> Result<Manifest> {
    store
        .get_json::<Manifest>(path)?
        .map(|(m, _)| m)
        .ok_or_else(|| {
            EngineError::metadata(format!("manifest {path} referenced but missing"))
        })
}

/// Walks the manifest chain backward from `start_path`, invoking `visit`
/// for every manifest until it returns `false` or the chain ends. A
/// missing parent aborts with a corrupt-chain error.
pub(crate) fn walk_chain(
    store: &Store,
    start_path: &str,
    mut visit: impl FnMut(&Manifest) -> bool,
) -> Result<()> {
    let mut next = Some(start_path.to_string());
    while let Some(path) = next {
        let manifest = read_manifest(store, &path)?;
        if !visit(&manifest) {
            return Ok(());
        }
        next = manifest.parent_manifest_path.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::store_for_uri;
    use ontic_core::config::EngineConfig;

    fn manifest(commit_id: u64, parent: Option<&str>) -> Manifest {
        Manifest {
            commit_id,
            parent_commit_id: commit_id.saturating_sub(1),
            parent_manifest_path: parent.map(str::to_string),
            created_at: Utc::now(),
            runtime_id: "test".into(),
            metadata: BTreeMap::new(),
            files: Vec::new(),
            schema_activations: Vec::new(),
        }
    }

    #[test]
    fn chain_walk_visits_newest_first() {
        let store = store_for_uri("mem://manifest-walk/r", &EngineConfig::default()).unwrap();
        store
            .put_json("commits/1-aa/manifest.json", &manifest(1, None))
            .unwrap();
        store
            .put_json(
                "commits/2-bb/manifest.json",
                &manifest(2, Some("commits/1-aa/manifest.json")),
            )
            .unwrap();

        let mut seen = Vec::new();
        walk_chain(&store, "commits/2-bb/manifest.json", |m| {
            seen.push(m.commit_id);
            true
        })
        .unwrap();
        assert_eq!(seen, vec![2, 1]);
    }

    #[test]
    fn chain_walk_stops_when_told() {
        let store = store_for_uri("mem://manifest-stop/r", &EngineConfig::default()).unwrap();
        store
            .put_json("commits/1-aa/manifest.json", &manifest(1, None))
            .unwrap();
        store
            .put_json(
                "commits/2-bb/manifest.json",
                &manifest(2, Some("commits/1-aa/manifest.json")),
            )
            .unwrap();

        let mut seen = Vec::new();
        walk_chain(&store, "commits/2-bb/manifest.json", |m| {
            seen.push(m.commit_id);
            false
        })
        .unwrap();
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn missing_parent_is_a_corrupt_chain() {
        let store = store_for_uri("mem://manifest-corrupt/r", &EngineConfig::default()).unwrap();
        store
            .put_json(
                "commits/2-bb/manifest.json",
                &manifest(2, Some("commits/1-gone/manifest.json")),
            )
            .unwrap();
        let err = walk_chain(&store, "commits/2-bb/manifest.json", |_| true).unwrap_err();
        assert!(matches!(err, EngineError::MetadataUnavailable { .. }));
    }
}
