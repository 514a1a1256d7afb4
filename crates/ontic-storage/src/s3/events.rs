//! Event bus persistence for the object-store backend.
//!
//! One object per record, coordinated entirely through per-object
//! conditional writes: claims are created with `If-None-Match` and
//! re-claimed with `If-Match` against the etag observed while
//! classifying them. A lost race is a skip, never an error.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use ontic_core::error::{EngineError, Result};
use ontic_core::event::{
    ClaimRecord, ClaimState, DEAD_LETTER_EVENT_TYPE, DeadLetterRecord, EventRecord, SessionRecord,
};

use crate::repo::ReleaseOutcome;
use crate::s3::repo::ObjectRepository;
use crate::s3::CasOutcome;
use crate::sqlite::events::backoff_delay_ms;

fn safe_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

fn event_path(namespace: &str, created_at: &DateTime<Utc>, id: &str) -> String {
    format!("events/{namespace}/{}_{id}.json", safe_ts(created_at))
}

fn claim_path(namespace: &str, event_id: &str, handler_id: &str) -> String {
    format!("claims/{namespace}/{event_id}/{handler_id}.json")
}

fn dead_letter_path(namespace: &str, event_id: &str, handler_id: &str) -> String {
    format!("dead_letters/{namespace}/{event_id}/{handler_id}.json")
}

fn session_path(namespace: &str, session_id: &str) -> String {
    format!("sessions/{namespace}/{session_id}.json")
}

impl ObjectRepository {
    /// Locates an event object by id (the id is the path suffix).
    fn find_event(&self, event_id: &str) -> Result<Option<(String, EventRecord)>> {
        let suffix = format!("_{event_id}.json");
        for meta in self.store.list("events")? {
            let rel = self.store.rel(&meta.location);
            if rel.ends_with(&suffix) {
                if let Some((event, _)) = self.store.get_json::<EventRecord>(&rel)? {
                    return Ok(Some((rel, event)));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn enqueue_events_impl(&self, events: &[EventRecord]) -> Result<()> {
        for event in events {
            let path = event_path(&event.namespace, &event.created_at, &event.id);
            match self.store.put_json_create(&path, event)? {
                CasOutcome::Stored(_) => {}
                CasOutcome::Conflict => {
                    return Err(EngineError::storage(format!(
                        "event object {path} already exists"
                    )));
                }
            }
        }
        debug!(count = events.len(), "events enqueued");
        Ok(())
    }

    pub(crate) fn claim_events_impl(
        &self,
        namespace: &str,
        handler_id: &str,
        session_id: &str,
        event_types: &[String],
        limit: usize,
        lease_ms: u64,
    ) -> Result<Vec<EventRecord>> {
        if event_types.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut candidates = Vec::new();
        for meta in self.store.list(&format!("events/{namespace}"))? {
            let rel = self.store.rel(&meta.location);
            if let Some((event, _)) = self.store.get_json::<EventRecord>(&rel)? {
                if event_types.contains(&event.event_type) {
                    candidates.push(event);
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let now = Utc::now();
        let lease_until = now + Duration::milliseconds(lease_ms as i64);
        let mut claimed = Vec::new();
        for event in candidates {
            if claimed.len() >= limit {
                break;
            }
            let path = claim_path(namespace, &event.id, handler_id);
            let new_claim = ClaimRecord {
                event_id: event.id.clone(),
                handler_id: handler_id.to_string(),
                session_id: session_id.to_string(),
                claimed_at: now,
                lease_until,
                ack_at: None,
                attempts: 0,
                available_at: now,
                last_error: None,
                dead_lettered_at: None,
            };
            match self.store.get_json::<ClaimRecord>(&path)? {
                None => {
                    // First claim: create-only write; a racing session's
                    // create wins and we skip.
                    if let CasOutcome::Stored(_) = self.store.put_json_create(&path, &new_claim)? {
                        claimed.push(event);
                    }
                }
                Some((current, e_tag)) => {
                    if current.state(now) != ClaimState::Reclaimable {
                        continue;
                    }
                    let reclaimed = ClaimRecord {
                        session_id: session_id.to_string(),
                        claimed_at: now,
                        lease_until,
                        ..current
                    };
                    if let CasOutcome::Stored(_) =
                        self.store.put_json_if_match(&path, &reclaimed, e_tag)?
                    {
                        claimed.push(event);
                    }
                }
            }
        }
        Ok(claimed)
    }

    fn load_claim(
        &self,
        handler_id: &str,
        event_id: &str,
    ) -> Result<(String, EventRecord, ClaimRecord, Option<String>)> {
        let (_, event) = self.find_event(event_id)?.ok_or_else(|| {
            EngineError::metadata(format!("event {event_id} not found"))
        })?;
        let path = claim_path(&event.namespace, event_id, handler_id);
        let (claim, e_tag) = self
            .store
            .get_json::<ClaimRecord>(&path)?
            .ok_or_else(|| {
                EngineError::metadata(format!(
                    "no claim for event {event_id} handler {handler_id}"
                ))
            })?;
        Ok((path, event, claim, e_tag))
    }

    pub(crate) fn ack_event_impl(&self, handler_id: &str, event_id: &str) -> Result<()> {
        let (path, _, claim, e_tag) = self.load_claim(handler_id, event_id)?;
        if claim.ack_at.is_some() || claim.dead_lettered_at.is_some() {
            return Err(EngineError::metadata(format!(
                "claim for event {event_id} handler {handler_id} is terminal"
            )));
        }
        let acked = ClaimRecord {
            ack_at: Some(Utc::now()),
            ..claim
        };
        match self.store.put_json_if_match(&path, &acked, e_tag)? {
            CasOutcome::Stored(_) => Ok(()),
            CasOutcome::Conflict => Err(EngineError::storage(format!(
                "claim {path} changed concurrently during ack"
            ))),
        }
    }

    pub(crate) fn release_event_impl(
        &self,
        handler_id: &str,
        event_id: &str,
        error: Option<&str>,
    ) -> Result<ReleaseOutcome> {
        let (path, event, claim, e_tag) = self.load_claim(handler_id, event_id)?;
        if claim.ack_at.is_some() || claim.dead_lettered_at.is_some() {
            return Err(EngineError::metadata(format!(
                "claim for event {event_id} handler {handler_id} is terminal"
            )));
        }
        let now = Utc::now();
        let attempts = claim.attempts + 1;

        if attempts >= self.config.event_max_attempts {
            let dead = ClaimRecord {
                attempts,
                lease_until: now,
                last_error: error.map(str::to_string),
                dead_lettered_at: Some(now),
                ..claim
            };
            match self.store.put_json_if_match(&path, &dead, e_tag)? {
                CasOutcome::Stored(_) => {}
                CasOutcome::Conflict => {
                    return Err(EngineError::storage(format!(
                        "claim {path} changed concurrently during release"
                    )));
                }
            }
            let record = DeadLetterRecord {
                event_id: event.id.clone(),
                handler_id: handler_id.to_string(),
                namespace: event.namespace.clone(),
                event_type: event.event_type.clone(),
                attempts,
                last_error: error.map(str::to_string),
                root_event_id: event.root_event_id.clone(),
                chain_depth: event.chain_depth,
                dead_lettered_at: now,
            };
            self.store.put_json(
                &dead_letter_path(&event.namespace, &event.id, handler_id),
                &record,
            )?;

            // Synthetic audit event preserving lineage.
            let synthetic = EventRecord {
                id: Uuid::new_v4().to_string(),
                namespace: event.namespace.clone(),
                event_type: DEAD_LETTER_EVENT_TYPE.to_string(),
                payload: json!({
                    "event_id": event.id,
                    "event_type": event.event_type,
                    "handler_id": handler_id,
                    "attempts": attempts,
                    "last_error": error,
                }),
                created_at: now,
                priority: event.priority,
                root_event_id: event.root_event_id.clone(),
                chain_depth: event.chain_depth + 1,
            };
            self.enqueue_events_impl(std::slice::from_ref(&synthetic))?;
            warn!(event_id, handler_id, attempts, "claim dead-lettered");
            return Ok(ReleaseOutcome::DeadLettered { attempts });
        }

        let delay = backoff_delay_ms(
            attempts,
            self.config.event_backoff_base_ms,
            self.config.event_backoff_max_ms,
        );
        let available_at = now + Duration::milliseconds(delay as i64);
        let released = ClaimRecord {
            attempts,
            lease_until: now,
            available_at,
            last_error: error.map(str::to_string),
            ..claim
        };
        match self.store.put_json_if_match(&path, &released, e_tag)? {
            CasOutcome::Stored(_) => Ok(ReleaseOutcome::Backoff {
                attempts,
                available_at,
            }),
            CasOutcome::Conflict => Err(EngineError::storage(format!(
                "claim {path} changed concurrently during release"
            ))),
        }
    }

    pub(crate) fn get_event_impl(&self, event_id: &str) -> Result<Option<EventRecord>> {
        Ok(self.find_event(event_id)?.map(|(_, event)| event))
    }

    pub(crate) fn replay_event_impl(&self, event_id: &str) -> Result<EventRecord> {
        let original = self.get_event_impl(event_id)?.ok_or_else(|| {
            EngineError::metadata(format!("event {event_id} not found"))
        })?;
        let id = Uuid::new_v4().to_string();
        let replay = EventRecord {
            root_event_id: id.clone(),
            id,
            namespace: original.namespace.clone(),
            event_type: original.event_type.clone(),
            payload: original.payload.clone(),
            created_at: Utc::now(),
            priority: original.priority,
            chain_depth: 0,
        };
        self.enqueue_events_impl(std::slice::from_ref(&replay))?;
        Ok(replay)
    }

    // -- Sessions ------------------------------------------------------------

    pub(crate) fn register_session_impl(&self, session: &SessionRecord) -> Result<()> {
        self.store
            .put_json(&session_path(&session.namespace, &session.session_id), session)
    }

    pub(crate) fn heartbeat_session_impl(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let suffix = format!("/{session_id}.json");
        for meta in self.store.list("sessions")? {
            let rel = self.store.rel(&meta.location);
            if rel.ends_with(&suffix) {
                if let Some((mut session, _)) = self.store.get_json::<SessionRecord>(&rel)? {
                    session.last_heartbeat = now;
                    return self.store.put_json(&rel, &session);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn release_session_claims_impl(&self, session_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut released = 0;
        for meta in self.store.list("claims")? {
            let rel = self.store.rel(&meta.location);
            let Some((claim, e_tag)) = self.store.get_json::<ClaimRecord>(&rel)? else {
                continue;
            };
            if claim.session_id != session_id || claim.state(now) != ClaimState::Claimed {
                continue;
            }
            let dropped = ClaimRecord {
                lease_until: now,
                available_at: now,
                ..claim
            };
            if let CasOutcome::Stored(_) = self.store.put_json_if_match(&rel, &dropped, e_tag)? {
                released += 1;
            }
        }
        Ok(released)
    }

    pub(crate) fn remove_session_impl(&self, session_id: &str) -> Result<()> {
        let suffix = format!("/{session_id}.json");
        for meta in self.store.list("sessions")? {
            let rel = self.store.rel(&meta.location);
            if rel.ends_with(&suffix) {
                return self.store.delete(&rel);
            }
        }
        Ok(())
    }

    // -- Dead letters / GC ---------------------------------------------------

    pub(crate) fn list_dead_letters_impl(&self, namespace: &str) -> Result<Vec<DeadLetterRecord>> {
        let mut out = Vec::new();
        for meta in self.store.list(&format!("dead_letters/{namespace}"))? {
            let rel = self.store.rel(&meta.location);
            if let Some((record, _)) = self.store.get_json::<DeadLetterRecord>(&rel)? {
                out.push(record);
            }
        }
        out.sort_by_key(|r| r.dead_lettered_at);
        Ok(out)
    }

    pub(crate) fn gc_events_impl(
        &self,
        namespace: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut removed = 0;
        for meta in self.store.list(&format!("events/{namespace}"))? {
            let rel = self.store.rel(&meta.location);
            let Some((event, _)) = self.store.get_json::<EventRecord>(&rel)? else {
                continue;
            };
            if event.created_at >= older_than {
                continue;
            }
            // Only terminal events are reaped: the event must have been
            // claimed at least once, and every claim must be acked or
            // dead-lettered. Never-claimed events are kept regardless of
            // age.
            let claim_prefix = format!("claims/{namespace}/{}", event.id);
            let claims = self.store.list(&claim_prefix)?;
            if claims.is_empty() {
                continue;
            }
            let mut live = false;
            let mut claim_paths = Vec::new();
            for claim_meta in &claims {
                let claim_rel = self.store.rel(&claim_meta.location);
                if let Some((claim, _)) = self.store.get_json::<ClaimRecord>(&claim_rel)? {
                    if claim.ack_at.is_none() && claim.dead_lettered_at.is_none() {
                        live = true;
                        break;
                    }
                }
                claim_paths.push(claim_rel);
            }
            if live {
                continue;
            }
            for claim_rel in claim_paths {
                self.store.delete(&claim_rel)?;
            }
            self.store.delete(&rel)?;
            removed += 1;
        }
        debug!(namespace, removed, at = %now, "event gc");
        Ok(removed)
    }
}
