//! Core types for the ontic ontology store.
//!
//! This crate contains the domain model shared by every other crate in the
//! workspace: schema descriptors and canonical type specs, record
//! identities, commit and change records, the event envelope, declared
//! intents, the predicate AST with its in-process evaluator, and the
//! engine-wide configuration and error taxonomy.

pub mod canonical;
pub mod commit;
pub mod config;
pub mod descriptor;
pub mod drift;
pub mod error;
pub mod eval;
pub mod event;
pub mod filter;
pub mod identity;
pub mod intent;
pub mod query;
pub mod row;
pub mod spec;
