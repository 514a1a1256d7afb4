//! Handler invocation context.
//!
//! Inside a handler, `ensure` appends to a handler-local queue and
//! `emit` buffers derived events; `commit` performs the lease-aware
//! commit and promotes the buffered emits once the commit is durable.
//! When the handler fails, the context is dropped and everything
//! buffered in it is discarded, leaving the claim to be retried.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use ontic_bus::HandlerScope;
use ontic_core::error::{EngineError, Result};
use ontic_core::event::{EventDraft, EventRecord};
use ontic_core::intent::{EntityType, Intent, RelationType};
use ontic_query::Query;
use ontic_storage::Repository;

use crate::session::Session;

/// Context handed to a handler for one claimed event.
pub struct HandlerContext<'a> {
    session: &'a Session,
    event: EventRecord,
    /// Claim lease expiry; commits inside the safety margin fail with
    /// `LeaseExpired` so a taken-over claim cannot double-write.
    lease_until: DateTime<Utc>,
    queue: Vec<Intent>,
    emits: Vec<EventRecord>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        session: &'a Session,
        event: EventRecord,
        lease_until: DateTime<Utc>,
    ) -> Self {
        Self {
            session,
            event,
            lease_until,
            queue: Vec::new(),
            emits: Vec::new(),
        }
    }

    /// The claimed event being handled.
    pub fn event(&self) -> &EventRecord {
        &self.event
    }

    /// Typed view of the claimed event's payload.
    pub fn decode<E: ontic_core::event::EventType>(&self) -> Result<E> {
        self.event.decode()
    }

    // -- Intents -------------------------------------------------------------

    /// Queues an entity intent local to this handler invocation.
    pub fn ensure_entity<E: EntityType>(&mut self, value: &E) -> Result<()> {
        self.queue.push(Intent::from_entity(value)?);
        Ok(())
    }

    /// Queues a relation intent local to this handler invocation.
    pub fn ensure_relation<R: RelationType>(&mut self, value: &R) -> Result<()> {
        self.queue.push(Intent::from_relation(value)?);
        Ok(())
    }

    // -- Events --------------------------------------------------------------

    /// Buffers a derived event inheriting this event's lineage
    /// (`root_event_id`, `chain_depth + 1`). Exceeding the configured
    /// chain depth is rejected here, at emit time.
    pub fn emit(&mut self, draft: EventDraft) -> Result<()> {
        let event = draft.into_derived_event(
            &self.event,
            self.session.config().max_event_chain_depth,
            Utc::now(),
        )?;
        self.emits.push(event);
        Ok(())
    }

    // -- Commit --------------------------------------------------------------

    /// Lease-aware commit of the handler-local queue.
    ///
    /// Fails with `LeaseExpired` once the claim lease is inside its
    /// safety margin (`lease / 3`), so that a session that lost the
    /// claim cannot persist a duplicate. On success the buffered emits
    /// are promoted to the durable queue.
    pub fn commit(&mut self, event: Option<EventDraft>) -> Result<Option<u64>> {
        let margin =
            Duration::milliseconds((self.session.config().event_claim_lease_ms / 3) as i64);
        if Utc::now() >= self.lease_until - margin {
            return Err(EngineError::LeaseExpired {
                owner: self.session.session_id().to_string(),
            });
        }

        // A commit event raised inside a handler is a derived event and
        // inherits this event's lineage.
        if let Some(draft) = event {
            self.emit(draft)?;
        }

        let intents: Vec<Intent> = self.queue.drain(..).collect();
        let commit_id = self.session.commit_intents(intents, None)?;

        // Promote emits buffered before this commit.
        let emits: Vec<EventRecord> = self.emits.drain(..).collect();
        if !emits.is_empty() {
            debug!(count = emits.len(), "promoting buffered emits");
            self.session.repo().enqueue_events(&emits)?;
        }
        Ok(commit_id)
    }

    // -- Queries -------------------------------------------------------------

    /// Typed query surface over the session's repository.
    pub fn query(&self) -> Result<Query<'_>> {
        self.session.query()
    }

    /// The owning session.
    pub fn session(&self) -> &Session {
        self.session
    }
}

impl HandlerScope for HandlerContext<'_> {
    fn drain_emits(&mut self) -> Vec<EventRecord> {
        self.emits.drain(..).collect()
    }
}
