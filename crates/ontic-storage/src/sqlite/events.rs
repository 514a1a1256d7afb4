//! Event bus persistence for the transactional backend.
//!
//! Claims are per-`(event_id, handler_id)` rows; all lifecycle
//! transitions run inside `BEGIN IMMEDIATE` transactions so that
//! concurrent sessions never double-claim.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, warn};
use uuid::Uuid;

use ontic_core::error::{EngineError, Result};
use ontic_core::event::{DEAD_LETTER_EVENT_TYPE, DeadLetterRecord, EventRecord, SessionRecord};

use crate::repo::ReleaseOutcome;
use crate::sqlite::store::{SqliteRepository, db_err};
use crate::sqlite::{fmt_ts, parse_ts};

/// Computes the next backoff delay: `min(base * 2^attempts, max)` plus
/// up to 100ms of jitter.
pub(crate) fn backoff_delay_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempts.min(20));
    exp.min(max_ms) + rand::thread_rng().gen_range(0..100)
}

fn insert_event(conn: &Connection, event: &EventRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO events
             (id, namespace, event_type, payload, created_at, priority, root_event_id, chain_depth)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id,
            event.namespace,
            event.event_type,
            event.payload.to_string(),
            fmt_ts(&event.created_at),
            event.priority,
            event.root_event_id,
            event.chain_depth
        ],
    )
    .map_err(|e| db_err("event insert failed", e))?;
    Ok(())
}

fn scan_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<(EventRecord, String, String)> {
    let payload: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok((
        EventRecord {
            id: row.get(0)?,
            namespace: row.get(1)?,
            event_type: row.get(2)?,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
            priority: row.get(5)?,
            root_event_id: row.get(6)?,
            chain_depth: row.get(7)?,
        },
        payload,
        created_at,
    ))
}

fn finish_event(parts: (EventRecord, String, String)) -> Result<EventRecord> {
    let (mut event, payload, created_at) = parts;
    event.payload = serde_json::from_str(&payload)?;
    event.created_at = parse_ts(&created_at)?;
    Ok(event)
}

const EVENT_COLUMNS: &str =
    "id, namespace, event_type, payload, created_at, priority, root_event_id, chain_depth";

impl SqliteRepository {
    pub(crate) fn enqueue_events_impl(&self, events: &[EventRecord]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock_conn()?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("enqueue transaction failed", e))?;
        for event in events {
            insert_event(&tx, event)?;
        }
        tx.commit().map_err(|e| db_err("enqueue commit failed", e))?;
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
        let mut guard = self.lock_conn()?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("claim transaction failed", e))?;
        let now = Utc::now();
        let now_s = fmt_ts(&now);
        let lease_until = fmt_ts(&(now + Duration::milliseconds(lease_ms as i64)));

        let type_placeholders: Vec<String> = (0..event_types.len())
            .map(|i| format!("?{}", i + 4))
            .collect();
        let sql = format!(
            "SELECT e.{EVENT_COLUMNS} FROM events e
             LEFT JOIN event_claims c ON c.event_id = e.id AND c.handler_id = ?1
             WHERE e.namespace = ?2
               AND e.event_type IN ({})
               AND (c.event_id IS NULL
                    OR (c.ack_at IS NULL AND c.dead_lettered_at IS NULL
                        AND c.lease_until <= ?3 AND c.available_at <= ?3))
             ORDER BY e.priority DESC, e.created_at ASC, e.id ASC
             LIMIT {limit}",
            type_placeholders.join(", "),
        );
        let mut params_vec: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(handler_id.to_string()),
            rusqlite::types::Value::Text(namespace.to_string()),
            rusqlite::types::Value::Text(now_s.clone()),
        ];
        for t in event_types {
            params_vec.push(rusqlite::types::Value::Text(t.clone()));
        }
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params_vec
            .iter()
            .map(|p| p as &dyn rusqlite::types::ToSql)
            .collect();

        let mut claimed = Vec::new();
        {
            let mut stmt = tx.prepare(&sql).map_err(|e| db_err("claim prepare failed", e))?;
            let rows = stmt
                .query_map(param_refs.as_slice(), scan_event)
                .map_err(|e| db_err("claim query failed", e))?;
            for row in rows {
                claimed.push(finish_event(row.map_err(|e| db_err("claim scan failed", e))?)?);
            }
        }

        for event in &claimed {
            tx.execute(
                "INSERT INTO event_claims
                     (event_id, handler_id, session_id, claimed_at, lease_until, attempts, available_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?4)
                 ON CONFLICT(event_id, handler_id) DO UPDATE SET
                     session_id = excluded.session_id,
                     claimed_at = excluded.claimed_at,
                     lease_until = excluded.lease_until",
                params![event.id, handler_id, session_id, now_s, lease_until],
            )
            .map_err(|e| db_err("claim upsert failed", e))?;
        }
        tx.commit().map_err(|e| db_err("claim commit failed", e))?;
        Ok(claimed)
    }

    pub(crate) fn ack_event_impl(&self, handler_id: &str, event_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn
            .execute(
                "UPDATE event_claims SET ack_at = ?3
                 WHERE event_id = ?1 AND handler_id = ?2 AND ack_at IS NULL
                   AND dead_lettered_at IS NULL",
                params![event_id, handler_id, fmt_ts(&Utc::now())],
            )
            .map_err(|e| db_err("ack failed", e))?;
        if updated == 0 {
            return Err(EngineError::metadata(format!(
                "no live claim for event {event_id} handler {handler_id}"
            )));
        }
        Ok(())
    }

    pub(crate) fn release_event_impl(
        &self,
        handler_id: &str,
        event_id: &str,
        error: Option<&str>,
    ) -> Result<ReleaseOutcome> {
        let mut guard = self.lock_conn()?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("release transaction failed", e))?;
        let now = Utc::now();

        let attempts: Option<u32> = tx
            .query_row(
                "SELECT attempts FROM event_claims
                 WHERE event_id = ?1 AND handler_id = ?2
                   AND ack_at IS NULL AND dead_lettered_at IS NULL",
                params![event_id, handler_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("release read failed", e))?;
        let Some(attempts) = attempts else {
            return Err(EngineError::metadata(format!(
                "no live claim for event {event_id} handler {handler_id}"
            )));
        };
        let attempts = attempts + 1;

        if attempts >= self.config.event_max_attempts {
            tx.execute(
                "UPDATE event_claims SET attempts = ?3, lease_until = ?4, last_error = ?5,
                        dead_lettered_at = ?4
                 WHERE event_id = ?1 AND handler_id = ?2",
                params![event_id, handler_id, attempts, fmt_ts(&now), error],
            )
            .map_err(|e| db_err("dead-letter update failed", e))?;

            let event = {
                let parts = tx
                    .query_row(
                        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                        params![event_id],
                        scan_event,
                    )
                    .map_err(|e| db_err("dead-letter event read failed", e))?;
                finish_event(parts)?
            };
            tx.execute(
                "INSERT INTO dead_letters
                     (event_id, handler_id, namespace, event_type, attempts, last_error,
                      root_event_id, chain_depth, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event_id,
                    handler_id,
                    event.namespace,
                    event.event_type,
                    attempts,
                    error,
                    event.root_event_id,
                    event.chain_depth,
                    fmt_ts(&now)
                ],
            )
            .map_err(|e| db_err("dead-letter insert failed", e))?;

            // Synthetic audit event preserving lineage for loop detection.
            let synthetic = EventRecord {
                id: Uuid::new_v4().to_string(),
                namespace: event.namespace.clone(),
                event_type: DEAD_LETTER_EVENT_TYPE.to_string(),
                payload: serde_json::json!({
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
            insert_event(&tx, &synthetic)?;
            tx.commit().map_err(|e| db_err("release commit failed", e))?;
            warn!(event_id, handler_id, attempts, "claim dead-lettered");
            return Ok(ReleaseOutcome::DeadLettered { attempts });
        }

        let delay = backoff_delay_ms(
            attempts,
            self.config.event_backoff_base_ms,
            self.config.event_backoff_max_ms,
        );
        let available_at = now + Duration::milliseconds(delay as i64);
        tx.execute(
            "UPDATE event_claims SET attempts = ?3, lease_until = ?4, available_at = ?5,
                    last_error = ?6
             WHERE event_id = ?1 AND handler_id = ?2",
            params![
                event_id,
                handler_id,
                attempts,
                fmt_ts(&now),
                fmt_ts(&available_at),
                error
            ],
        )
        .map_err(|e| db_err("release update failed", e))?;
        tx.commit().map_err(|e| db_err("release commit failed", e))?;
        Ok(ReleaseOutcome::Backoff {
            attempts,
            available_at,
        })
    }

    pub(crate) fn get_event_impl(&self, event_id: &str) -> Result<Option<EventRecord>> {
        let conn = self.lock_conn()?;
        let parts = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![event_id],
                scan_event,
            )
            .optional()
            .map_err(|e| db_err("event read failed", e))?;
        parts.map(finish_event).transpose()
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
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sessions (session_id, namespace, started_at, last_heartbeat, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                 namespace = excluded.namespace,
                 last_heartbeat = excluded.last_heartbeat,
                 metadata = excluded.metadata",
            params![
                session.session_id,
                session.namespace,
                fmt_ts(&session.started_at),
                fmt_ts(&session.last_heartbeat),
                session.metadata.to_string()
            ],
        )
        .map_err(|e| db_err("session register failed", e))?;
        Ok(())
    }

    pub(crate) fn heartbeat_session_impl(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sessions SET last_heartbeat = ?2 WHERE session_id = ?1",
            params![session_id, fmt_ts(&now)],
        )
        .map_err(|e| db_err("heartbeat failed", e))?;
        Ok(())
    }

    pub(crate) fn release_session_claims_impl(&self, session_id: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        let now = fmt_ts(&Utc::now());
        let released = conn
            .execute(
                "UPDATE event_claims SET lease_until = ?2, available_at = ?2
                 WHERE session_id = ?1 AND ack_at IS NULL AND dead_lettered_at IS NULL
                   AND lease_until > ?2",
                params![session_id, now],
            )
            .map_err(|e| db_err("session claim release failed", e))?;
        Ok(released as u64)
    }

    pub(crate) fn remove_session_impl(&self, session_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(|e| db_err("session remove failed", e))?;
        Ok(())
    }

    // -- Dead letters / GC ---------------------------------------------------

    pub(crate) fn list_dead_letters_impl(&self, namespace: &str) -> Result<Vec<DeadLetterRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, handler_id, namespace, event_type, attempts, last_error,
                        root_event_id, chain_depth, dead_lettered_at
                 FROM dead_letters WHERE namespace = ?1
                 ORDER BY dead_lettered_at ASC, id ASC",
            )
            .map_err(|e| db_err("dead letters failed", e))?;
        let rows = stmt
            .query_map(params![namespace], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, u32>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, u32>(7)?,
                    r.get::<_, String>(8)?,
                ))
            })
            .map_err(|e| db_err("dead letters failed", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (event_id, handler_id, ns, event_type, attempts, last_error, root, depth, at) =
                row.map_err(|e| db_err("dead letter scan failed", e))?;
            out.push(DeadLetterRecord {
                event_id,
                handler_id,
                namespace: ns,
                event_type,
                attempts,
                last_error,
                root_event_id: root,
                chain_depth: depth,
                dead_lettered_at: parse_ts(&at)?,
            });
        }
        Ok(out)
    }

    pub(crate) fn gc_events_impl(
        &self,
        namespace: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let mut guard = self.lock_conn()?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("gc transaction failed", e))?;
        let cutoff = fmt_ts(&older_than);

        // Only terminal events are reaped: at least one claim exists and
        // every claim is acked or dead-lettered. An event with no claims
        // was never processed and is kept regardless of age.
        let mut reapable = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT e.id FROM events e
                     WHERE e.namespace = ?1 AND e.created_at < ?2
                       AND EXISTS (SELECT 1 FROM event_claims c
                                   WHERE c.event_id = e.id)
                       AND NOT EXISTS (SELECT 1 FROM event_claims c
                                       WHERE c.event_id = e.id
                                         AND c.ack_at IS NULL
                                         AND c.dead_lettered_at IS NULL)",
                )
                .map_err(|e| db_err("gc select failed", e))?;
            let rows = stmt
                .query_map(params![namespace, cutoff], |r| r.get::<_, String>(0))
                .map_err(|e| db_err("gc select failed", e))?;
            for row in rows {
                reapable.push(row.map_err(|e| db_err("gc scan failed", e))?);
            }
        }
        for event_id in &reapable {
            tx.execute(
                "DELETE FROM event_claims WHERE event_id = ?1",
                params![event_id],
            )
            .map_err(|e| db_err("gc claim delete failed", e))?;
            tx.execute("DELETE FROM events WHERE id = ?1", params![event_id])
                .map_err(|e| db_err("gc event delete failed", e))?;
        }
        tx.commit().map_err(|e| db_err("gc commit failed", e))?;
        let removed = reapable.len() as u64;
        debug!(namespace, removed, "event gc");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = backoff_delay_ms(1, 1_000, 60_000);
        assert!((2_000..2_100).contains(&d1));
        let d4 = backoff_delay_ms(4, 1_000, 60_000);
        assert!((16_000..16_100).contains(&d4));
        let capped = backoff_delay_ms(12, 1_000, 60_000);
        assert!((60_000..60_100).contains(&capped));
    }
}
