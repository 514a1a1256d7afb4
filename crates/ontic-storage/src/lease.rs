//! The write lease: scoped exclusive ownership of the commit path.
//!
//! A lease is handed out by [`crate::repo::Repository::begin_write`] and
//! must be held for every commit. It releases its backing lock on drop,
//! on every exit path. Backends with keep-alive renewal (the object
//! store) share the lease state with their renewal thread and mark the
//! lease unsafe when a renewal fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use ontic_core::error::{EngineError, Result};

/// Lease TTL for the transactional backend's lock rows.
pub const WRITE_LEASE_TTL_MS: u64 = 30_000;

/// Name of the single ontology-wide write lock.
pub const WRITE_LOCK_NAME: &str = "ontology_write";

/// Shared mutable lease state, visible to keep-alive threads.
#[derive(Debug)]
pub struct LeaseState {
    pub expires_at: DateTime<Utc>,
    /// Set when a renewal failed; the lease must not be trusted further.
    pub compromised: bool,
}

/// Exclusive write lease over one repository.
pub struct WriteLease {
    owner_id: String,
    lease_ttl_ms: u64,
    acquired_at: DateTime<Utc>,
    state: Arc<Mutex<LeaseState>>,
    stop_keepalive: Option<Arc<AtomicBool>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for WriteLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLease")
            .field("owner_id", &self.owner_id)
            .field("lease_ttl_ms", &self.lease_ttl_ms)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

impl WriteLease {
    /// Creates a lease; `release` runs exactly once on drop.
    pub fn new(
        owner_id: impl Into<String>,
        lease_ttl_ms: u64,
        release: Box<dyn FnOnce() + Send>,
    ) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.into(),
            lease_ttl_ms,
            acquired_at: now,
            state: Arc::new(Mutex::new(LeaseState {
                expires_at: now + Duration::milliseconds(lease_ttl_ms as i64),
                compromised: false,
            })),
            stop_keepalive: None,
            release: Some(release),
        }
    }

    /// Attaches a keep-alive stop flag, flipped on drop before release.
    pub fn with_keepalive_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop_keepalive = Some(stop);
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn lease_ttl_ms(&self) -> u64 {
        self.lease_ttl_ms
    }

    /// Shared state handle for renewal threads.
    pub fn state(&self) -> Arc<Mutex<LeaseState>> {
        Arc::clone(&self.state)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.state.lock().map(|s| s.expires_at).unwrap_or_else(|e| e.into_inner().expires_at)
    }

    /// Records a successful renewal.
    pub fn renewed_until(&self, expires_at: DateTime<Utc>) {
        if let Ok(mut s) = self.state.lock() {
            s.expires_at = expires_at;
        }
    }

    /// Marks the lease unusable after a failed renewal.
    pub fn mark_compromised(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.compromised = true;
        }
    }

    /// The lease-expiry guard: fails once `now` is inside the safety
    /// margin (`ttl / 3` before expiry) or after a failed renewal.
    /// Called before every critical operation performed under the lease.
    pub fn guard(&self, now: DateTime<Utc>) -> Result<()> {
        let (expires_at, compromised) = match self.state.lock() {
            Ok(s) => (s.expires_at, s.compromised),
            Err(poisoned) => {
                let s = poisoned.into_inner();
                (s.expires_at, s.compromised)
            }
        };
        let margin = Duration::milliseconds((self.lease_ttl_ms / 3) as i64);
        if compromised || now >= expires_at - margin {
            return Err(EngineError::LeaseExpired {
                owner: self.owner_id.clone(),
            });
        }
        Ok(())
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop_keepalive {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
