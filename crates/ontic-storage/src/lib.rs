//! Storage backends for the ontic ontology store.
//!
//! Two interchangeable implementations of the [`repo::Repository`]
//! contract: a transactional SQLite backend and an object-store backend
//! with a manifest-chain commit log and columnar data files. Consumers
//! depend on the trait rather than on concrete stores.

pub mod lease;
pub mod repo;
pub mod s3;
pub mod sqlite;

pub use lease::WriteLease;
pub use repo::{open_repository, HeadInfo, ReleaseOutcome, Repository, StoredSchema};
