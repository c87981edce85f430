//! PostgreSQL backend for the qgate session pool.
//!
//! Provides a [`PgConnector`] that implements [`Connector`] over the
//! synchronous `postgres` client. Descriptor fields map onto libpq settings:
//!
//! ```text
//! Data Source=host[:port]  → host, port (default 5432)
//! Catalog=…                → dbname
//! User Id=…                → user (falls back to the configured default user)
//! Password=…               → password (a bearer or exchanged token when no User Id)
//! ```
//!
//! Connections are plain TCP. Command timeouts become `SET statement_timeout`
//! and cancellation goes through the server's cancel-request protocol.

mod values;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use postgres::fallible_iterator::FallibleIterator;
use postgres::types::{ToSql, Type};
use postgres::{CancelToken, Client, NoTls, Row, RowIter};
use qgate_auth::ConnectionDescriptor;
use qgate_auth::descriptor::{CATALOG, DATA_SOURCE, PASSWORD, USER_ID};
use qgate_pool::{BackendError, CancelHandle, CellValue, Command, Connector, RowCursor, Session};
use tracing::{debug, warn};

pub const DEFAULT_PORT: u16 = 5432;

// ── Connector ────────────────────────────────────────────────────────

/// Builds [`PgSession`]s from connection descriptors.
#[derive(Clone, Debug)]
pub struct PgConnector {
    default_user: Option<String>,
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(default_user: Option<String>) -> Self {
        Self {
            default_user,
            connect_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Translate a descriptor into client settings.
    pub fn pg_config(&self, descriptor: &ConnectionDescriptor) -> Result<postgres::Config, BackendError> {
        let source = descriptor
            .field(DATA_SOURCE)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BackendError::Connection("descriptor has no Data Source".into()))?;
        let (host, port) = split_host_port(&source)?;

        let user = descriptor
            .field(USER_ID)
            .or_else(|| self.default_user.clone())
            .ok_or_else(|| {
                BackendError::Connection("descriptor has no User Id and no default user is configured".into())
            })?;

        let mut config = postgres::Config::new();
        config
            .host(&host)
            .port(port)
            .user(&user)
            .connect_timeout(self.connect_timeout)
            .application_name("qgate");
        if let Some(db) = descriptor.field(CATALOG).filter(|d| !d.is_empty()) {
            config.dbname(&db);
        }
        if let Some(password) = descriptor.field(PASSWORD) {
            config.password(password);
        }
        Ok(config)
    }
}

impl Connector for PgConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn Session>, BackendError> {
        let config = self.pg_config(descriptor)?;
        Ok(Box::new(PgSession::new(config)))
    }
}

fn split_host_port(source: &str) -> Result<(String, u16), BackendError> {
    let source = source.trim();
    match source.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| BackendError::Connection(format!("invalid port in Data Source: {port}")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((source.to_string(), DEFAULT_PORT)),
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// One PostgreSQL connection. Opened lazily by [`Session::open`].
pub struct PgSession {
    config: postgres::Config,
    client: Option<Client>,
    cancel: Arc<PgCancel>,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("hosts", &self.config.get_hosts().len())
            .field("open", &self.client.is_some())
            .finish()
    }
}

impl PgSession {
    fn new(config: postgres::Config) -> Self {
        Self {
            config,
            client: None,
            cancel: Arc::new(PgCancel::default()),
        }
    }

    fn client(&mut self) -> Result<&mut Client, BackendError> {
        self.client
            .as_mut()
            .ok_or_else(|| BackendError::Connection("session is not open".into()))
    }
}

impl Session for PgSession {
    fn open(&mut self) -> Result<(), BackendError> {
        if self.client.is_some() {
            return Ok(());
        }
        let client = self
            .config
            .connect(NoTls)
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        self.cancel.arm(client.cancel_token());
        self.client = Some(client);
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> Result<Box<dyn RowCursor + '_>, BackendError> {
        let client = self.client()?;

        if let Some(timeout) = command.timeout {
            client
                .batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis()))
                .map_err(execution_error)?;
        }

        let statement = client.prepare(&command.text).map_err(execution_error)?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.type_().clone()))
            .collect();
        let rows = client
            .query_raw(&statement, std::iter::empty::<&dyn ToSql>())
            .map_err(execution_error)?;

        Ok(Box::new(PgCursor {
            rows,
            columns,
            current: None,
        }))
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancel.clone()
    }

    fn is_closed(&self) -> bool {
        self.client.as_ref().is_none_or(Client::is_closed)
    }

    fn dispose(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        // The sync client blocks on its own runtime, which panics inside async code.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || close_client(client));
            }
            Err(_) => close_client(client),
        }
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn close_client(client: Client) {
    if let Err(e) = client.close() {
        debug!(error = %e, "error closing postgres connection");
    }
}

fn execution_error(e: postgres::Error) -> BackendError {
    match e.as_db_error() {
        Some(db) => BackendError::Execution(format!("{} ({})", db.message(), db.code().code())),
        None => BackendError::Execution(e.to_string()),
    }
}

// ── Cancellation ─────────────────────────────────────────────────────

#[derive(Default)]
struct PgCancel {
    token: Mutex<Option<CancelToken>>,
}

impl PgCancel {
    fn arm(&self, token: CancelToken) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }
}

impl CancelHandle for PgCancel {
    fn cancel(&self) {
        let token = self.token.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = token.as_ref() {
            if let Err(e) = token.cancel_query(NoTls) {
                warn!(error = %e, "postgres cancel request failed");
            }
        }
    }
}

// ── Cursor ───────────────────────────────────────────────────────────

struct PgCursor<'a> {
    rows: RowIter<'a>,
    columns: Vec<(String, Type)>,
    current: Option<Row>,
}

impl RowCursor for PgCursor<'_> {
    fn read(&mut self) -> Result<bool, BackendError> {
        self.current = self.rows.next().map_err(execution_error)?;
        Ok(self.current.is_some())
    }

    fn field_count(&self) -> usize {
        self.columns.len()
    }

    fn name(&self, index: usize) -> &str {
        self.columns.get(index).map_or("", |(name, _)| name.as_str())
    }

    fn value(&self, index: usize) -> Result<CellValue, BackendError> {
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| BackendError::Execution("no current row".into()))?;
        let (_, ty) = self
            .columns
            .get(index)
            .ok_or_else(|| BackendError::Execution(format!("column {index} out of range")))?;
        values::decode(row, index, ty).map_err(execution_error)
    }
}
