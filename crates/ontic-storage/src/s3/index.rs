//! Advisory per-type indices with gap repair.
//!
//! Indices map commit ranges to data file paths so reads avoid walking
//! the whole manifest chain. They are best-effort: a crash between head
//! CAS and index write leaves them lagging, and any reader or writer
//! repairs them from the chain (the authority) on next use.

use serde::{Deserialize, Serialize};
use tracing::debug;

use ontic_core::descriptor::RecordKind;
use ontic_core::error::Result;

use crate::s3::layout::index_path;
use crate::s3::manifest::{HeadObject, walk_chain};
use crate::s3::Store;

/// One indexed data file (or compacted snapshot) for a type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    pub min_commit_id: u64,
    pub max_commit_id: u64,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

/// `meta/indices/<kind>/<name>.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TypeIndex {
    pub max_indexed_commit: u64,
    pub entries: Vec<IndexEntry>,
}

impl TypeIndex {
    /// Entries overlapping a commit window, optionally filtered to one
    /// schema version (entries without a version survive the filter).
    pub(crate) fn entries_in_window(
        &self,
        window_start: u64,
        window_end: u64,
        schema_version: Option<i64>,
    ) -> Vec<&IndexEntry> {
        self.entries
            .iter()
            .filter(|e| e.min_commit_id <= window_end && e.max_commit_id >= window_start)
            .filter(|e| match (schema_version, e.schema_version_id) {
                (Some(want), Some(have)) => want == have,
                _ => true,
            })
            .collect()
    }
}

/// Reads the stored index, or an empty one when missing.
pub(crate) fn read_index(store: &Store, kind: RecordKind, name: &str) -> Result<TypeIndex> {
    Ok(store
        .get_json::<TypeIndex>(&index_path(kind, name))?
        .map(|(idx, _)| idx)
        .unwrap_or_default())
}

/// Returns the index for a type, repaired against the manifest chain.
///
/// Lag is detected when the watermark trails the head, or when the head
/// commit's entry paths do not match the committed attempt (an orphan
/// attempt from a lost CAS race got indexed). Repair walks the chain
/// backward from the head until it reaches covered territory,
/// synthesising entries from each manifest's file list.
pub(crate) fn resolve_index(
    store: &Store,
    kind: RecordKind,
    name: &str,
    head: &HeadObject,
) -> Result<TypeIndex> {
    let mut index = read_index(store, kind, name)?;
    if head.commit_id == 0 {
        return Ok(TypeIndex::default());
    }
    let Some(manifest_path) = &head.manifest_path else {
        return Ok(index);
    };

    let mut needs_repair = index.max_indexed_commit < head.commit_id;
    if !needs_repair {
        // Verify the head commit's entries point at the committed attempt.
        let head_manifest = crate::s3::manifest::read_manifest(store, manifest_path)?;
        for file in head_manifest
            .files
            .iter()
            .filter(|f| f.kind == kind && f.type_name == name)
        {
            if !index.entries.iter().any(|e| e.path == file.path) {
                needs_repair = true;
                break;
            }
        }
    }
    if !needs_repair {
        return Ok(index);
    }

    // Entries beyond the watermark may reference orphan attempts; they are
    // replaced wholesale by chain-derived ones.
    let watermark = index.max_indexed_commit.min(head.commit_id);
    index.entries.retain(|e| e.max_commit_id <= watermark);

    let mut synthesized = Vec::new();
    walk_chain(store, manifest_path, |manifest| {
        if manifest.commit_id <= watermark {
            return false;
        }
        for file in manifest
            .files
            .iter()
            .filter(|f| f.kind == kind && f.type_name == name)
        {
            synthesized.push(IndexEntry {
                min_commit_id: manifest.commit_id,
                max_commit_id: manifest.commit_id,
                path: file.path.clone(),
                schema_version_id: Some(file.schema_version_id),
                row_count: Some(file.row_count),
            });
        }
        true
    })?;
    synthesized.reverse();
    debug!(
        kind = kind.as_str(),
        name,
        repaired = synthesized.len(),
        "index gap repair"
    );
    index.entries.extend(synthesized);
    index.max_indexed_commit = head.commit_id;
    Ok(index)
}

/// Persists an index (best-effort advisory write).
pub(crate) fn write_index(
    store: &Store,
    kind: RecordKind,
    name: &str,
    index: &TypeIndex,
) -> Result<()> {
    store.put_json(&index_path(kind, name), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(commit: u64, path: &str) -> IndexEntry {
        IndexEntry {
            min_commit_id: commit,
            max_commit_id: commit,
            path: path.into(),
            schema_version_id: Some(1),
            row_count: Some(1),
        }
    }

    #[test]
    fn window_filter_selects_overlapping_entries() {
        let index = TypeIndex {
            max_indexed_commit: 5,
            entries: vec![
                entry(1, "a"),
                entry(3, "b"),
                entry(5, "c"),
                IndexEntry {
                    min_commit_id: 2,
                    max_commit_id: 4,
                    path: "snap".into(),
                    schema_version_id: None,
                    row_count: None,
                },
            ],
        };
        let hits = index.entries_in_window(2, 4, Some(1));
        let paths: Vec<&str> = hits.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "snap"]);
    }

    #[test]
    fn version_filter_keeps_unversioned_snapshots() {
        let index = TypeIndex {
            max_indexed_commit: 2,
            entries: vec![
                IndexEntry {
                    schema_version_id: Some(2),
                    ..entry(1, "v2-file")
                },
                IndexEntry {
                    schema_version_id: None,
                    ..entry(2, "snapshot")
                },
            ],
        };
        let hits = index.entries_in_window(1, 2, Some(1));
        let paths: Vec<&str> = hits.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["snapshot"]);
    }
}
