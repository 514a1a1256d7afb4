//! Reactive event loop for the ontic ontology store.
//!
//! Handlers are plain values in an explicit registry; the loop claims
//! durable per-`(event, handler)` leases from the repository, dispatches
//! synchronously, and acks or releases with backoff. Cron schedules emit
//! root events from inside the same loop.

pub mod cron;
pub mod handler;
pub mod runner;
pub mod schedule;

pub use cron::CronExpr;
pub use handler::{Handler, HandlerScope};
pub use runner::{LoopReport, run_loop};
pub use schedule::Schedule;
