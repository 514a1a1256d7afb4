//! Typed query DSL for the ontic ontology store.
//!
//! A [`Query`] is bound to a repository snapshot and a cache of current
//! schema versions (owned by the session). Typed builders compile to the
//! backend-neutral [`ontic_core::query::QueryRequest`] and execute
//! through the repository trait, so the same query text runs against the
//! SQLite and object-store backends.

pub mod agg;
pub mod builder;
pub mod proxy;
pub mod traversal;

pub use agg::{avg, avg_len, count, max_of, min_of, sum};
pub use builder::{EntityQuery, RelationQuery};
pub use proxy::{FieldProxy, field};
pub use traversal::PathResult;

use std::collections::BTreeMap;

use ontic_core::error::{EngineError, Result};
use ontic_core::intent::{EntityType, RelationType};
use ontic_storage::Repository;

/// Entry point for typed queries, bound to one repository handle and the
/// session's current schema versions.
pub struct Query<'a> {
    repo: &'a dyn Repository,
    versions: BTreeMap<String, i64>,
}

impl<'a> Query<'a> {
    /// Binds a query surface to a repository and version cache.
    pub fn new(repo: &'a dyn Repository, versions: BTreeMap<String, i64>) -> Self {
        Self { repo, versions }
    }

    pub(crate) fn version_of(&self, type_name: &str) -> Result<i64> {
        self.versions.get(type_name).copied().ok_or_else(|| {
            EngineError::metadata(format!(
                "no current schema version for {type_name}; validate the session first"
            ))
        })
    }

    pub(crate) fn repo(&self) -> &'a dyn Repository {
        self.repo
    }

    /// Starts a typed entity query.
    pub fn entities<T: EntityType>(&self) -> Result<EntityQuery<'a, T>> {
        EntityQuery::new(self)
    }

    /// Starts a typed relation query.
    pub fn relations<R: RelationType>(&self) -> Result<RelationQuery<'a, R>> {
        RelationQuery::new(self)
    }
}
