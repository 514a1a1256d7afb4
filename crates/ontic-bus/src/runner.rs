//! The event loop.
//!
//! Single-threaded and cooperative per session: each iteration claims a
//! bounded batch per handler, dispatches synchronously, promotes or
//! discards buffered emits, and honours the aggregate per-iteration cap
//! before sleeping. Handler execution happens outside the write lease.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use ontic_core::config::EngineConfig;
use ontic_core::error::Result;
use ontic_core::event::{EventRecord, SessionRecord};
use ontic_storage::Repository;

use crate::handler::{Handler, HandlerScope, sort_handlers};
use crate::schedule::Schedule;

/// Summary of one `run` invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub iterations: u64,
    pub events_handled: u64,
    pub events_failed: u64,
    pub schedule_fires: u64,
}

/// Drives the reactive loop until `stop` is set or `max_iterations` is
/// reached. `make_ctx` builds the per-event handler context; the context
/// surrenders its un-promoted emits through [`HandlerScope`].
#[allow(clippy::too_many_arguments)]
pub fn run_loop<C, F>(
    repo: &dyn Repository,
    config: &EngineConfig,
    namespace: &str,
    session_id: &str,
    mut handlers: Vec<Handler<C>>,
    mut schedules: Vec<Schedule>,
    stop: &Arc<AtomicBool>,
    max_iterations: Option<u64>,
    mut make_ctx: F,
) -> Result<LoopReport>
where
    C: HandlerScope,
    F: FnMut(&EventRecord, DateTime<Utc>) -> C,
{
    let now = Utc::now();
    repo.register_session(&SessionRecord {
        session_id: session_id.to_string(),
        namespace: namespace.to_string(),
        started_at: now,
        last_heartbeat: now,
        metadata: json!({ "runtime_id": repo.runtime_id() }),
    })?;
    info!(session_id, namespace, "event loop started");

    sort_handlers(&mut handlers);
    let mut report = LoopReport::default();
    let mut last_heartbeat = now;

    let result = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        if let Some(max) = max_iterations {
            if report.iterations >= max {
                break Ok(());
            }
        }
        report.iterations += 1;

        // Schedules emit root events from inside the loop; consumers
        // race for their claims.
        let now = Utc::now();
        for schedule in &mut schedules {
            if let Some(template) = schedule.due(now) {
                let event = template.into_root_event(namespace, now);
                debug!(event_type = %event.event_type, "schedule fired");
                repo.enqueue_events(std::slice::from_ref(&event))?;
                report.schedule_fires += 1;
            }
        }

        let mut handled_this_iteration = 0usize;
        for handler in &handlers {
            let remaining = config
                .max_events_per_iteration
                .saturating_sub(handled_this_iteration);
            if remaining == 0 {
                break;
            }
            let batch = repo.claim_events(
                namespace,
                &handler.id,
                session_id,
                std::slice::from_ref(&handler.event_type),
                config.event_claim_limit.min(remaining),
                config.event_claim_lease_ms,
            )?;
            for event in batch {
                handled_this_iteration += 1;
                let lease_until =
                    Utc::now() + Duration::milliseconds(config.event_claim_lease_ms as i64);
                let mut ctx = make_ctx(&event, lease_until);
                match (handler.func)(&mut ctx) {
                    Ok(()) => {
                        // Promote emits buffered after the last commit,
                        // then ack. Chain-depth rejection already
                        // happened inside emit.
                        let emits = ctx.drain_emits();
                        if !emits.is_empty() {
                            repo.enqueue_events(&emits)?;
                        }
                        repo.ack_event(&handler.id, &event.id)?;
                        report.events_handled += 1;
                    }
                    Err(error) => {
                        // Buffered emits are discarded with the context.
                        warn!(
                            handler = %handler.id,
                            event_id = %event.id,
                            %error,
                            "handler failed; releasing claim"
                        );
                        repo.release_event(&handler.id, &event.id, Some(&error.to_string()))?;
                        report.events_failed += 1;
                    }
                }
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
        }

        let now = Utc::now();
        if (now - last_heartbeat).num_milliseconds()
            >= config.session_heartbeat_interval_ms as i64
        {
            repo.heartbeat_session(session_id, now)?;
            last_heartbeat = now;
        }

        if config.event_poll_interval_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(config.event_poll_interval_ms));
        }
    };

    // Graceful exit: surrender anything still claimed, then deregister.
    let released = repo.release_session_claims(session_id).unwrap_or(0);
    if released > 0 {
        debug!(session_id, released, "released outstanding claims on stop");
    }
    repo.remove_session(session_id)?;
    info!(
        session_id,
        iterations = report.iterations,
        handled = report.events_handled,
        failed = report.events_failed,
        "event loop stopped"
    );
    result.map(|()| report)
}
