//! Compaction: merging per-commit data files into snapshots.
//!
//! Runs under the write lease. Snapshots preserve `commit_id` per row and
//! deterministic `(commit_id, identity)` ordering, so every temporal
//! query reads identically before and after. Original per-commit files
//! are retained; purging them is a separate follow-up.

use chrono::Utc;
use tracing::{debug, info, warn};

use ontic_core::error::{EngineError, Result};
use ontic_core::row::StoredRow;

use crate::lease::WriteLease;
use crate::repo::CompactionReport;
use crate::s3::index::{IndexEntry, TypeIndex, resolve_index, write_index};
use crate::s3::manifest::read_head;
use crate::s3::repo::ObjectRepository;
use crate::s3::{layout, parq};

impl ObjectRepository {
    pub(crate) fn compact_impl(&self, lease: &WriteLease) -> Result<CompactionReport> {
        lease.guard(Utc::now())?;
        let (head, _) = read_head(&self.store)?;
        let mut report = CompactionReport::default();
        if head.commit_id == 0 {
            return Ok(report);
        }

        for entry in self.type_entries_pub()? {
            let index = resolve_index(&self.store, entry.kind, &entry.name, &head)?;
            if index.entries.len() < 2 {
                continue;
            }
            lease.guard(Utc::now())?;

            let mut rows: Vec<StoredRow> = Vec::new();
            let mut min_commit = u64::MAX;
            let mut max_commit = 0u64;
            for file in &index.entries {
                let fetched = self.store.get(&file.path)?.ok_or_else(|| {
                    EngineError::metadata(format!("indexed file {} is missing", file.path))
                })?;
                rows.extend(parq::read_rows(entry.kind, fetched.bytes)?);
                min_commit = min_commit.min(file.min_commit_id);
                max_commit = max_commit.max(file.max_commit_id);
            }
            rows.sort_by(|a, b| {
                a.commit_id
                    .cmp(&b.commit_id)
                    .then_with(|| a.identity.storage_key().cmp(&b.identity.storage_key()))
            });

            let descriptor = match self.stored_schema_impl(entry.kind, &entry.name)? {
                Some(stored) => stored.descriptor()?,
                None => continue,
            };
            let snapshot = layout::snapshot_path(entry.kind, &entry.name, min_commit, max_commit);
            let bytes = parq::write_rows(&descriptor, &rows)?;
            let row_count = rows.len() as u64;
            self.store.put(&snapshot, bytes)?;

            // Head stability check immediately before index publish; a
            // concurrent commit means the plan is stale.
            let (current_head, _) = read_head(&self.store)?;
            if current_head.commit_id != head.commit_id {
                warn!(
                    type_name = %entry.name,
                    planned_head = head.commit_id,
                    observed_head = current_head.commit_id,
                    "head moved during compaction; abandoning this type"
                );
                continue;
            }
            lease.guard(Utc::now())?;

            let merged = index.entries.len();
            let compacted = TypeIndex {
                max_indexed_commit: head.commit_id,
                entries: vec![IndexEntry {
                    min_commit_id: min_commit,
                    max_commit_id: max_commit,
                    path: snapshot,
                    schema_version_id: None,
                    row_count: Some(row_count),
                }],
            };
            write_index(&self.store, entry.kind, &entry.name, &compacted)?;

            debug!(type_name = %entry.name, merged, rows = row_count, "type compacted");
            report.files_merged += merged;
            report.snapshots_written += 1;
            report.rows += row_count;
        }

        info!(
            files_merged = report.files_merged,
            snapshots = report.snapshots_written,
            "compaction finished"
        );
        Ok(report)
    }

    /// Known types, visible to the compactor.
    fn type_entries_pub(&self) -> Result<Vec<crate::s3::repo::TypeEntry>> {
        Ok(self
            .store
            .get_json::<Vec<crate::s3::repo::TypeEntry>>(layout::TYPES)?
            .map(|(t, _)| t)
            .unwrap_or_default())
    }
}
