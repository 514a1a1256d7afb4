//! Relation traversal: `entities(T).via::<R>()`.
//!
//! Traversals are lookup-only; they resolve source entities, scan the
//! connecting relations filtered to the resolved source keys, and return
//! source-tagged results. Source identity is preserved even when a
//! source has no outgoing relations, and destination entities are
//! deduplicated per source regardless of how many relations connect
//! them.

use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;

use ontic_core::error::Result;
use ontic_core::filter::Filter;
use ontic_core::identity::Identity;
use ontic_core::intent::{EntityType, RelationType};
use ontic_core::query::QueryRequest;
use ontic_storage::Repository;

use crate::builder::EntityQuery;
use crate::proxy::field;

/// One source's traversal result.
#[derive(Debug)]
pub struct PathResult<E> {
    /// Key of the source entity the path started at.
    pub source_key: String,
    /// Destination entities, deduplicated, in destination-key order.
    pub entities: Vec<E>,
}

/// A pending traversal from entity type `T` through relation `R`.
pub struct Traversal<'a, T: EntityType, R: RelationType<Left = T>> {
    source: EntityQuery<'a, T>,
    _marker: PhantomData<R>,
}

impl<'a, T: EntityType, R: RelationType<Left = T>> Traversal<'a, T, R> {
    pub(crate) fn new(source: EntityQuery<'a, T>) -> Result<Self> {
        Ok(Self {
            source,
            _marker: PhantomData,
        })
    }

    /// Executes the traversal.
    pub fn collect(self) -> Result<Vec<PathResult<R::Right>>> {
        let repo = self.source.core.repo;
        let temporal = self.source.core.request.temporal;

        // Resolve source identities first; zero-hop sources stay in the
        // result.
        let source_rows = self.source.rows()?;
        let mut source_keys = Vec::new();
        for row in &source_rows {
            if let Identity::Entity { key } = &row.identity {
                source_keys.push(key.clone());
            }
        }
        if source_keys.is_empty() {
            return Ok(Vec::new());
        }

        // Hop 1: relations of type R restricted to the resolved sources.
        let relation_descriptor = R::descriptor();
        let left_field = relation_descriptor
            .left
            .as_ref()
            .map(|l| l.key_field.clone())
            .unwrap_or_default();
        let mut relation_request = QueryRequest::latest(relation_descriptor);
        relation_request.temporal = temporal;
        relation_request.schema_version =
            current_version_for(repo, &relation_request.type_name)?;
        let restriction: Filter = field(&left_field).in_(source_keys.iter().map(String::as_str));
        relation_request.filter = Some(restriction);
        let relation_rows = repo.query_rows(&relation_request)?;

        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &relation_rows {
            if let Identity::Relation {
                left_key, right_key, ..
            } = &row.identity
            {
                edges
                    .entry(left_key.clone())
                    .or_default()
                    .push(right_key.clone());
            }
        }

        // Hop 2: destination entities.
        let right_descriptor = <R::Right as EntityType>::descriptor();
        let right_pk = right_descriptor
            .primary_key_field()
            .unwrap_or_default()
            .to_string();
        let mut right_request = QueryRequest::latest(right_descriptor.clone());
        right_request.temporal = temporal;
        right_request.schema_version = current_version_for(repo, &right_request.type_name)?;
        let all_rights: HashSet<String> = edges.values().flatten().cloned().collect();
        if !all_rights.is_empty() {
            right_request.filter =
                Some(field(&right_pk).in_(all_rights.iter().map(String::as_str)));
        }
        let right_rows = if all_rights.is_empty() {
            Vec::new()
        } else {
            repo.query_rows(&right_request)?
        };
        let mut rights: BTreeMap<String, R::Right> = BTreeMap::new();
        for row in &right_rows {
            if let Identity::Entity { key } = &row.identity {
                rights.insert(key.clone(), row.decode::<R::Right>(&right_descriptor)?);
            }
        }

        // Assemble per-source results with destination dedup.
        let mut out = Vec::new();
        for source_key in source_keys {
            let mut seen = HashSet::new();
            let mut entities = Vec::new();
            for right_key in edges.get(&source_key).into_iter().flatten() {
                if !seen.insert(right_key.clone()) {
                    continue;
                }
                if let Some(entity) = rights.get(right_key) {
                    // Decode a fresh copy per path.
                    entities.push(clone_via_json(entity)?);
                }
            }
            out.push(PathResult {
                source_key,
                entities,
            });
        }
        Ok(out)
    }
}

fn current_version_for(
    repo: &dyn ontic_storage::Repository,
    type_name: &str,
) -> Result<i64> {
    repo.current_versions()?
        .get(type_name)
        .copied()
        .ok_or_else(|| {
            ontic_core::error::EngineError::metadata(format!(
                "no current schema version for {type_name}"
            ))
        })
}

fn clone_via_json<E: EntityType>(value: &E) -> Result<E> {
    Ok(serde_json::from_value(serde_json::to_value(value)?)?)
}
