//! Backend session abstraction.
//!
//! The gateway never talks to a database client directly. A [`Connector`]
//! builds [`Session`]s from a connection descriptor; a session runs
//! [`Command`]s and yields a [`RowCursor`]. All calls are blocking and are
//! made from the blocking thread pool.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use qgate_auth::ConnectionDescriptor;
use serde::{Serialize, Serializer};

use crate::error::BackendError;

/// Builds unopened backend sessions.
pub trait Connector: Send + Sync {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn Session>, BackendError>;
}

/// An open, stateful connection to the backend.
pub trait Session: Send {
    /// Establish the connection. Called once, before the first command.
    fn open(&mut self) -> Result<(), BackendError>;

    fn create_command(&self, text: &str) -> Command {
        Command::new(text)
    }

    /// Run a command and return a cursor over its rows.
    fn execute(&mut self, command: &Command) -> Result<Box<dyn RowCursor + '_>, BackendError>;

    /// A handle that can cancel an in-flight `execute` from another thread.
    fn cancel_handle(&self) -> Arc<dyn CancelHandle>;

    /// Whether the backend already knows the connection is unusable.
    fn is_closed(&self) -> bool {
        false
    }

    /// Close the connection. Must be idempotent.
    fn dispose(&mut self);
}

/// Cancels whatever the owning session is executing.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// Forward-only cursor over a result set.
pub trait RowCursor {
    /// Advance to the next row. Returns `false` once the rows are exhausted.
    fn read(&mut self) -> Result<bool, BackendError>;
    fn field_count(&self) -> usize;
    fn name(&self, index: usize) -> &str;
    fn value(&self, index: usize) -> Result<CellValue, BackendError>;
}

/// A query bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    /// `None` leaves the backend default in place.
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A single cell, in the backend's native type.
///
/// Serializes with standard JSON typing. Dates and timestamps become ISO-8601
/// strings, decimals keep their exact text, binary values become base64, and
/// non-finite floats become `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_unit(),
            CellValue::Bool(b) => serializer.serialize_bool(*b),
            CellValue::Int(i) => serializer.serialize_i64(*i),
            CellValue::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            CellValue::Float(_) => serializer.serialize_unit(),
            CellValue::Decimal(d) => serializer.serialize_str(d),
            CellValue::Text(s) => serializer.serialize_str(s),
            CellValue::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
            CellValue::DateTime(dt) => serializer.collect_str(&dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            CellValue::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            CellValue::Bytes(b) => serializer.serialize_str(&STANDARD.encode(b)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn json(v: CellValue) -> String {
        serde_json::to_string(&v).unwrap()
    }

    #[test]
    fn scalars_use_native_json_types() {
        assert_eq!(json(CellValue::Null), "null");
        assert_eq!(json(CellValue::Bool(true)), "true");
        assert_eq!(json(CellValue::Int(-42)), "-42");
        assert_eq!(json(CellValue::Float(1.5)), "1.5");
        assert_eq!(json(CellValue::Text("a\"b".into())), r#""a\"b""#);
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(json(CellValue::Float(f64::NAN)), "null");
        assert_eq!(json(CellValue::Float(f64::INFINITY)), "null");
    }

    #[test]
    fn decimals_keep_exact_text() {
        assert_eq!(json(CellValue::Decimal("12345678901234567890.01".into())), r#""12345678901234567890.01""#);
    }

    #[test]
    fn dates_are_iso_strings() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(json(CellValue::Date(d)), r#""2024-02-29""#);
        let dt = d.and_hms_opt(13, 5, 9).unwrap();
        assert_eq!(json(CellValue::DateTime(dt)), r#""2024-02-29T13:05:09""#);
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 13, 5, 9).unwrap();
        assert_eq!(json(CellValue::Timestamp(ts)), r#""2024-02-29T13:05:09+00:00""#);
    }

    #[test]
    fn bytes_are_base64() {
        assert_eq!(json(CellValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef])), r#""3q2+7w==""#);
    }

    #[test]
    fn command_timeout_builder() {
        let cmd = Command::new("EVALUATE t").with_timeout(Duration::from_secs(120));
        assert_eq!(cmd.text, "EVALUATE t");
        assert_eq!(cmd.timeout, Some(Duration::from_secs(120)));
    }
}
