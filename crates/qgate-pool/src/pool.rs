//! Session pool keyed by connection descriptor.
//!
//! # Architecture
//!
//! ```text
//! acquire(descriptor, credential)
//!   → lock the idle stack for descriptor
//!     → pop; expired (inside guard window)? dispose, keep popping
//!     → live session found → mark checked out, return it
//!   → stack empty → connect + open on the blocking pool → return new session
//! release(session)  → push onto its descriptor's idle stack
//! discard(session)  → dispose, never pooled again
//! ```
//!
//! Idle stacks live in a `DashMap` and each has its own lock, so different
//! descriptors never contend. Checked-out sessions are owned by the caller;
//! the pool holds no reference to them. Expired sessions are only removed when
//! an acquire on their key finds them; there is no background sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use qgate_auth::{ConnectionDescriptor, Credential, decode_expiry};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::Connector;
use crate::clock::{Clock, SystemClock};
use crate::error::{PoolError, PoolResult};
use crate::session::{PooledSession, SessionSnapshot};

/// Configuration for the session pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Sessions this close to `valid_until` are not handed out (default: 60s).
    pub guard_window: Duration,
    /// Lifetime of sessions not bound to a bearer token, and the cap for those that are (default: 5m).
    pub default_validity: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            guard_window: Duration::from_secs(60),
            default_validity: Duration::from_secs(300),
        }
    }
}

/// Lifetime counters across all keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    pub created: u64,
    pub reused: u64,
    pub expired: u64,
    pub released: u64,
    pub discarded: u64,
}

/// Idle sessions for one descriptor. The key is shown redacted.
#[derive(Clone, Debug, Serialize)]
pub struct KeyStats {
    pub key: String,
    pub idle: usize,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub counters: PoolCounters,
    pub keys: Vec<KeyStats>,
}

type IdleStack = Arc<Mutex<Vec<PooledSession>>>;

pub struct SessionPool {
    idle: DashMap<ConnectionDescriptor, IdleStack>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

impl SessionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_clock(config, connector, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PoolConfig, connector: Arc<dyn Connector>, clock: Arc<dyn Clock>) -> Self {
        Self {
            idle: DashMap::new(),
            connector,
            config,
            clock,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn guard_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.guard_window).unwrap_or(chrono::Duration::seconds(60))
    }

    fn default_validity(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.default_validity).unwrap_or(chrono::Duration::minutes(5))
    }

    fn stack_for(&self, key: &ConnectionDescriptor) -> IdleStack {
        // Clone the Arc so the map shard is not held across the await on the stack lock.
        Arc::clone(
            self.idle
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .value(),
        )
    }

    /// Drop the map entry for `key` if it holds no idle sessions.
    fn prune(&self, key: &ConnectionDescriptor) {
        self.idle
            .remove_if(key, |_, stack| stack.try_lock().is_ok_and(|idle| idle.is_empty()));
    }

    /// Compute when a new session for `credential` stops being reusable.
    ///
    /// Bearer sessions live until the token's `exp`, never past the default
    /// window and never before `now`. Tokens without a readable expiry get the
    /// default window.
    pub fn valid_until(&self, credential: &Credential, now: DateTime<Utc>) -> DateTime<Utc> {
        let default = now + self.default_validity();
        match credential.bearer_token() {
            Some(token) => match decode_expiry(token) {
                Ok(exp) => exp.clamp(now, default),
                Err(e) => {
                    warn!(error = %e, "bearer token expiry unreadable, using default validity");
                    default
                }
            },
            None => default,
        }
    }

    /// Check out a session for `key`, reusing an idle one when a live one exists.
    pub async fn acquire(
        &self,
        key: &ConnectionDescriptor,
        credential: &Credential,
    ) -> PoolResult<PooledSession> {
        let stack = self.stack_for(key);
        let now = self.clock.now();
        let guard = self.guard_window();

        let (reused, emptied) = {
            let mut idle = stack.lock().await;
            let mut found = None;
            while let Some(session) = idle.pop() {
                if session.is_expired(now, guard) {
                    debug!(
                        session = session.id(),
                        valid_until = %session.valid_until(),
                        "discarding expired idle session"
                    );
                    self.expired.fetch_add(1, Ordering::Relaxed);
                    session.dispose();
                    continue;
                }
                found = Some(session);
                break;
            }
            (found, idle.is_empty())
        };
        if emptied {
            self.prune(key);
        }

        if let Some(mut session) = reused {
            session.record_checkout(now);
            self.reused.fetch_add(1, Ordering::Relaxed);
            debug!(
                session = session.id(),
                times_checked_out = session.metrics().times_checked_out,
                "reused idle session"
            );
            return Ok(session);
        }

        let connector = Arc::clone(&self.connector);
        let descriptor = key.clone();
        let backend = tokio::task::spawn_blocking(move || {
            let mut backend = connector.connect(&descriptor)?;
            backend.open()?;
            Ok::<_, PoolError>(backend)
        })
        .await
        .map_err(|e| PoolError::Join(e.to_string()))??;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let opened_at = self.clock.now();
        let valid_until = self.valid_until(credential, opened_at);
        let mut session = PooledSession::new(id, key.clone(), valid_until, backend, opened_at);
        session.record_checkout(opened_at);
        self.created.fetch_add(1, Ordering::Relaxed);

        debug!(
            session = id,
            scheme = credential.scheme(),
            %valid_until,
            "opened new session"
        );
        Ok(session)
    }

    /// Return a session to the idle stack for its key.
    ///
    /// Only call this after a fully successful query. Sessions the backend
    /// reports as closed are disposed instead of pooled.
    pub async fn release(&self, mut session: PooledSession) {
        if session.is_closed() {
            debug!(session = session.id(), "backend closed, discarding instead of releasing");
            self.discard(session);
            return;
        }

        let now = self.clock.now();
        if session.is_expired(now, self.guard_window()) {
            debug!(
                session = session.id(),
                valid_until = %session.valid_until(),
                "session expired while checked out, disposing"
            );
            self.expired.fetch_add(1, Ordering::Relaxed);
            session.dispose();
            return;
        }

        session.record_checkin(now);
        let key = session.connection_key().clone();
        let id = session.id();
        loop {
            let stack = self.stack_for(&key);
            let mut idle = stack.lock().await;
            // The entry may have been pruned between lookup and lock.
            let current = self
                .idle
                .get(&key)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &stack));
            if !current {
                continue;
            }
            idle.push(session);
            self.released.fetch_add(1, Ordering::Relaxed);
            debug!(session = id, idle_count = idle.len(), "returned session to pool");
            return;
        }
    }

    /// Dispose a session that must not be reused (failed, canceled, or suspect).
    pub fn discard(&self, session: PooledSession) {
        debug!(session = session.id(), "discarding session");
        self.discarded.fetch_add(1, Ordering::Relaxed);
        session.dispose();
    }

    /// Number of idle sessions held for `key`.
    pub async fn idle_count(&self, key: &ConnectionDescriptor) -> usize {
        let stack = match self.idle.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return 0,
        };
        let idle = stack.lock().await;
        idle.len()
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let stacks: Vec<(ConnectionDescriptor, IdleStack)> = self
            .idle
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut keys = Vec::with_capacity(stacks.len());
        for (key, stack) in stacks {
            let idle = stack.lock().await;
            keys.push(KeyStats {
                key: key.redacted(),
                idle: idle.len(),
                sessions: idle.iter().map(PooledSession::snapshot).collect(),
            });
        }
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        PoolStats {
            counters: self.counters(),
            keys,
        }
    }

    /// Dispose every idle session. Returns how many were closed.
    pub async fn drain(&self) -> usize {
        let stacks: Vec<IdleStack> = self.idle.iter().map(|e| Arc::clone(e.value())).collect();
        let mut closed = 0;
        for stack in stacks {
            let mut idle = stack.lock().await;
            for session in idle.drain(..) {
                session.dispose();
                closed += 1;
            }
        }
        self.idle.clear();
        info!(closed, "session pool drained");
        closed
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.config)
            .field("keys", &self.idle.len())
            .finish_non_exhaustive()
    }
}
