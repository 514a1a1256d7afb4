//! Event envelope, claims and bus records.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Event type of the synthetic audit event enqueued when a claim is
/// dead-lettered.
pub const DEAD_LETTER_EVENT_TYPE: &str = "event.dead_letter";

/// Default priority for events that do not set one.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Marker trait for typed event payloads.
pub trait EventType: Serialize + DeserializeOwned {
    /// Stable event type name, e.g. `order.placed`.
    const NAME: &'static str;
}

/// A persisted event with its envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event id (UUID v4).
    pub id: String,
    /// Logical partition of the bus.
    pub namespace: String,
    /// Application event type name.
    pub event_type: String,
    /// User payload.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Higher priority is consumed earlier.
    pub priority: i64,
    /// Id of the root event of this chain; equals `id` for root events.
    pub root_event_id: String,
    /// Emit hops from the root event; 0 for root events.
    pub chain_depth: u32,
}

impl EventRecord {
    /// Decodes the payload into a typed event.
    pub fn decode<E: EventType>(&self) -> Result<E> {
        if self.event_type != E::NAME {
            return Err(EngineError::validation(format!(
                "event is `{}`, not `{}`",
                self.event_type,
                E::NAME
            )));
        }
        serde_json::from_value(self.payload.clone()).map_err(EngineError::from)
    }
}

/// An event prepared for enqueue; the envelope is stamped by the bus.
#[derive(Clone, Debug)]
pub struct EventDraft {
    pub event_type: String,
    pub payload: Value,
    pub priority: i64,
}

impl EventDraft {
    /// Builds a draft from a typed payload.
    pub fn new<E: EventType>(event: &E) -> Result<Self> {
        Ok(Self {
            event_type: E::NAME.to_string(),
            payload: serde_json::to_value(event)?,
            priority: DEFAULT_PRIORITY,
        })
    }

    /// Builds a draft from a raw type name and payload.
    pub fn raw(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Overrides the priority (higher is consumed earlier).
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Stamps a root envelope: fresh id, `root_event_id = id`,
    /// `chain_depth = 0`.
    pub fn into_root_event(self, namespace: &str, now: DateTime<Utc>) -> EventRecord {
        let id = Uuid::new_v4().to_string();
        EventRecord {
            root_event_id: id.clone(),
            id,
            namespace: namespace.to_string(),
            event_type: self.event_type,
            payload: self.payload,
            created_at: now,
            priority: self.priority,
            chain_depth: 0,
        }
    }

    /// Stamps a derived envelope inheriting the parent's lineage. Fails
    /// when the resulting depth exceeds `max_chain_depth`.
    pub fn into_derived_event(
        self,
        parent: &EventRecord,
        max_chain_depth: u32,
        now: DateTime<Utc>,
    ) -> Result<EventRecord> {
        let chain_depth = parent.chain_depth + 1;
        if chain_depth > max_chain_depth {
            return Err(EngineError::EventLoopLimit {
                message: format!(
                    "emitting `{}` would reach chain depth {chain_depth} (max {max_chain_depth}), root event {}",
                    self.event_type, parent.root_event_id
                ),
            });
        }
        Ok(EventRecord {
            id: Uuid::new_v4().to_string(),
            namespace: parent.namespace.clone(),
            event_type: self.event_type,
            payload: self.payload,
            created_at: now,
            priority: self.priority,
            root_event_id: parent.root_event_id.clone(),
            chain_depth,
        })
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Durable per-`(event, handler)` claim state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub event_id: String,
    pub handler_id: String,
    pub session_id: String,
    pub claimed_at: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
    pub ack_at: Option<DateTime<Utc>>,
    /// Completed delivery attempts.
    pub attempts: u32,
    /// Earliest next claim time while backing off.
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

/// The six claim lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Claimed,
    Backoff,
    Reclaimable,
    Acked,
    DeadLettered,
}

impl ClaimRecord {
    /// Classifies the claim at instant `now`. A missing row is
    /// `Unclaimed`; terminal states win over lease arithmetic.
    pub fn state(&self, now: DateTime<Utc>) -> ClaimState {
        if self.dead_lettered_at.is_some() {
            return ClaimState::DeadLettered;
        }
        if self.ack_at.is_some() {
            return ClaimState::Acked;
        }
        if self.lease_until > now {
            return ClaimState::Claimed;
        }
        if self.available_at > now {
            return ClaimState::Backoff;
        }
        ClaimState::Reclaimable
    }
}

/// Append-only audit row written when a claim dead-letters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event_id: String,
    pub handler_id: String,
    pub namespace: String,
    pub event_type: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub root_event_id: String,
    pub chain_depth: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A registered bus session with its heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Value,
}

impl SessionRecord {
    /// A session is dead when its heartbeat is older than the TTL.
    pub fn is_dead(&self, now: DateTime<Utc>, session_ttl_ms: u64) -> bool {
        let age = now - self.last_heartbeat;
        age.num_milliseconds() > session_ttl_ms as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn claim(now: DateTime<Utc>) -> ClaimRecord {
        ClaimRecord {
            event_id: "e1".into(),
            handler_id: "h1".into(),
            session_id: "s1".into(),
            claimed_at: now,
            lease_until: now + Duration::seconds(30),
            ack_at: None,
            attempts: 0,
            available_at: now,
            last_error: None,
            dead_lettered_at: None,
        }
    }

    #[test]
    fn claim_state_transitions() {
        let now = Utc::now();
        let mut c = claim(now);
        assert_eq!(c.state(now), ClaimState::Claimed);

        // Lease lapsed, still backing off.
        c.lease_until = now - Duration::seconds(1);
        c.available_at = now + Duration::seconds(10);
        assert_eq!(c.state(now), ClaimState::Backoff);

        // Backoff elapsed.
        c.available_at = now - Duration::seconds(1);
        assert_eq!(c.state(now), ClaimState::Reclaimable);

        // Terminal states win.
        c.ack_at = Some(now);
        assert_eq!(c.state(now), ClaimState::Acked);
        c.dead_lettered_at = Some(now);
        assert_eq!(c.state(now), ClaimState::DeadLettered);
    }

    #[test]
    fn root_event_envelope() {
        let draft = EventDraft::raw("order.placed", json!({ "order_id": "o1" }));
        let event = draft.into_root_event("default", Utc::now());
        assert_eq!(event.root_event_id, event.id);
        assert_eq!(event.chain_depth, 0);
        assert_eq!(event.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn derived_event_inherits_lineage() {
        let root = EventDraft::raw("a", json!({})).into_root_event("default", Utc::now());
        let child = EventDraft::raw("b", json!({}))
            .into_derived_event(&root, 5, Utc::now())
            .unwrap();
        assert_eq!(child.root_event_id, root.id);
        assert_eq!(child.chain_depth, 1);

        let grandchild = EventDraft::raw("c", json!({}))
            .into_derived_event(&child, 5, Utc::now())
            .unwrap();
        assert_eq!(grandchild.root_event_id, root.id);
        assert_eq!(grandchild.chain_depth, 2);
    }

    #[test]
    fn chain_depth_cap_rejected_at_emit() {
        let root = EventDraft::raw("a", json!({})).into_root_event("default", Utc::now());
        let child = EventDraft::raw("b", json!({}))
            .into_derived_event(&root, 1, Utc::now())
            .unwrap();
        let err = EventDraft::raw("c", json!({}))
            .into_derived_event(&child, 1, Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::EventLoopLimit { .. }));
    }

    #[test]
    fn dead_session_detection() {
        let now = Utc::now();
        let s = SessionRecord {
            session_id: "s1".into(),
            namespace: "default".into(),
            started_at: now - Duration::seconds(120),
            last_heartbeat: now - Duration::seconds(90),
            metadata: json!({}),
        };
        assert!(s.is_dead(now, 60_000));
        assert!(!s.is_dead(now, 120_000));
    }
}
