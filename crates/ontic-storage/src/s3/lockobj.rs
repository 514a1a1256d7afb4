//! Write-lock object with lease keep-alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ontic_core::error::{EngineError, Result};

use crate::lease::WriteLease;
use crate::s3::layout::LOCK;
use crate::s3::{CasOutcome, Store};

/// `meta/locks/ontology_write.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct LockObject {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lease_ttl_ms: u64,
}

/// Acquires the write lock, retrying with jittered backoff until
/// `lock_timeout_ms`, and starts the keep-alive thread renewing at
/// `ttl / 3`.
pub(crate) fn acquire(
    store: &Arc<Store>,
    owner_id: &str,
    lease_ttl_ms: u64,
    lock_timeout_ms: u64,
) -> Result<WriteLease> {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        let now = Utc::now();
        let lock = LockObject {
            owner_id: owner_id.to_string(),
            acquired_at: now,
            expires_at: now + Duration::milliseconds(lease_ttl_ms as i64),
            lease_ttl_ms,
        };

        let holder = match store.get_json::<LockObject>(LOCK)? {
            None => match store.put_json_create(LOCK, &lock)? {
                CasOutcome::Stored(_) => None,
                CasOutcome::Conflict => Some("unknown".to_string()),
            },
            Some((current, e_tag)) => {
                if current.expires_at <= now {
                    // Takeover of an expired lease, conditional on the
                    // exact object we observed.
                    warn!(holder = %current.owner_id, "taking over expired write lock");
                    match store.put_json_if_match(LOCK, &lock, e_tag)? {
                        CasOutcome::Stored(_) => None,
                        CasOutcome::Conflict => Some(current.owner_id),
                    }
                } else if current.owner_id == owner_id {
                    // Re-acquisition by the same owner refreshes the lease.
                    match store.put_json_if_match(LOCK, &lock, e_tag)? {
                        CasOutcome::Stored(_) => None,
                        CasOutcome::Conflict => Some(current.owner_id),
                    }
                } else {
                    Some(current.owner_id)
                }
            }
        };

        match holder {
            None => {
                debug!(owner_id, "write lock acquired");
                return Ok(start_lease(store, owner_id, lease_ttl_ms));
            }
            Some(holder) => {
                if started.elapsed().as_millis() as u64 >= lock_timeout_ms {
                    return Err(EngineError::LockContention {
                        lock: LOCK.to_string(),
                        holder,
                    });
                }
                attempt += 1;
                let base = 25u64.saturating_mul(u64::from(attempt.min(8)));
                let jitter = rand::thread_rng().gen_range(0..50);
                std::thread::sleep(std::time::Duration::from_millis(base + jitter));
            }
        }
    }
}

fn start_lease(store: &Arc<Store>, owner_id: &str, lease_ttl_ms: u64) -> WriteLease {
    let release_store = Arc::clone(store);
    let release_owner = owner_id.to_string();
    let release = Box::new(move || {
        // Verify ownership before deleting; a takeover must not lose its
        // freshly acquired lock to our cleanup.
        if let Ok(Some((current, _))) = release_store.get_json::<LockObject>(LOCK) {
            if current.owner_id == release_owner {
                let _ = release_store.delete(LOCK);
            }
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let lease = WriteLease::new(owner_id, lease_ttl_ms, release)
        .with_keepalive_stop(Arc::clone(&stop));

    let state = lease.state();
    let keepalive_store = Arc::clone(store);
    let keepalive_owner = owner_id.to_string();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_millis(lease_ttl_ms / 3);
        loop {
            std::thread::sleep(interval);
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let now = Utc::now();
            let renewed = LockObject {
                owner_id: keepalive_owner.clone(),
                acquired_at: now,
                expires_at: now + Duration::milliseconds(lease_ttl_ms as i64),
                lease_ttl_ms,
            };
            let outcome = keepalive_store
                .get_json::<LockObject>(LOCK)
                .and_then(|current| match current {
                    Some((lock, e_tag)) if lock.owner_id == keepalive_owner => {
                        keepalive_store.put_json_if_match(LOCK, &renewed, e_tag)
                    }
                    _ => Ok(CasOutcome::Conflict),
                });
            match outcome {
                Ok(CasOutcome::Stored(_)) => {
                    if let Ok(mut s) = state.lock() {
                        s.expires_at = renewed.expires_at;
                    }
                }
                Ok(CasOutcome::Conflict) | Err(_) => {
                    warn!(owner_id = %keepalive_owner, "lease renewal failed; marking unsafe");
                    if let Ok(mut s) = state.lock() {
                        s.compromised = true;
                    }
                    return;
                }
            }
        }
    });

    lease
}
