//! A backend session plus the bookkeeping the pool needs.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use qgate_auth::ConnectionDescriptor;
use serde::Serialize;

use crate::backend::{CancelHandle, Session};

/// Cumulative checkout metrics for one session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionMetrics {
    pub times_checked_out: u64,
    #[serde(serialize_with = "serialize_millis")]
    pub total_checkout_time: chrono::Duration,
    pub created_at: DateTime<Utc>,
    pub last_checked_out: Option<DateTime<Utc>>,
    pub last_checked_in: Option<DateTime<Utc>>,
}

fn serialize_millis<S: serde::Serializer>(d: &chrono::Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_milliseconds())
}

/// Point-in-time view of a pooled session, safe to expose.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub valid_until: DateTime<Utc>,
    pub checked_out: bool,
    #[serde(flatten)]
    pub metrics: SessionMetrics,
}

/// A backend session owned either by the pool (idle) or by one caller (checked out).
///
/// This is the sole owner of the backend handle. Dropping a session that was
/// neither released nor discarded disposes the handle.
pub struct PooledSession {
    id: u64,
    connection_key: ConnectionDescriptor,
    valid_until: DateTime<Utc>,
    checked_out: bool,
    metrics: SessionMetrics,
    backend: Box<dyn Session>,
    disposed: bool,
}

impl PooledSession {
    pub(crate) fn new(
        id: u64,
        connection_key: ConnectionDescriptor,
        valid_until: DateTime<Utc>,
        backend: Box<dyn Session>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            connection_key,
            valid_until,
            checked_out: false,
            metrics: SessionMetrics {
                times_checked_out: 0,
                total_checkout_time: chrono::Duration::zero(),
                created_at: now,
                last_checked_out: None,
                last_checked_in: None,
            },
            backend,
            disposed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_key(&self) -> &ConnectionDescriptor {
        &self.connection_key
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    pub fn is_checked_out(&self) -> bool {
        self.checked_out
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// True once `now` is inside the guard window before `valid_until`.
    /// A window that underflows the calendar counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, guard_window: chrono::Duration) -> bool {
        self.valid_until
            .checked_sub_signed(guard_window)
            .is_none_or(|reusable_until| now >= reusable_until)
    }

    pub fn backend(&mut self) -> &mut dyn Session {
        self.backend.as_mut()
    }

    pub fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.backend.cancel_handle()
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }

    pub(crate) fn record_checkout(&mut self, now: DateTime<Utc>) {
        self.checked_out = true;
        self.metrics.times_checked_out += 1;
        self.metrics.last_checked_out = Some(now);
    }

    pub(crate) fn record_checkin(&mut self, now: DateTime<Utc>) {
        self.checked_out = false;
        if let Some(out) = self.metrics.last_checked_out {
            self.metrics.total_checkout_time += now - out;
        }
        self.metrics.last_checked_in = Some(now);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            valid_until: self.valid_until,
            checked_out: self.checked_out,
            metrics: self.metrics.clone(),
        }
    }

    /// Close the backend connection. The session can never be pooled again.
    pub fn dispose(mut self) {
        self.dispose_backend();
    }

    fn dispose_backend(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.backend.dispose();
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        self.dispose_backend();
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("connection_key", &self.connection_key)
            .field("valid_until", &self.valid_until)
            .field("checked_out", &self.checked_out)
            .finish_non_exhaustive()
    }
}
