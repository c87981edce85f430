//! Query execution on a checked-out session.
//!
//! # Architecture
//!
//! ```text
//! run(pool, session, query)
//!   → spawn_blocking: execute ─▶ started(Ok | Err) ─▶ ResultWriter ─▶ ChannelWriter
//!   → watcher task: request canceled while execute is in flight → backend cancel
//!   → completion task: write succeeded → pool.release, anything else → pool.discard
//! ```
//!
//! `run` returns once the backend has accepted or rejected the query, so the
//! caller can still choose a status code. After that, errors only truncate
//! the body. The response body holds a drop guard on the cancellation token;
//! a client that goes away cancels the rest of the work.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use qgate_core::ResultMode;
use qgate_pool::{Command, PooledSession, SessionPool};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::{QueryError, WriteError};
use crate::writer::{ChannelWriter, ResultWriter, WriteSummary};

/// Chunks buffered between the blocking writer and the HTTP body.
const BODY_CHANNEL_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct QueryExecutor {
    command_timeout: Duration,
    mode: ResultMode,
}

/// A query that has started producing rows.
#[derive(Debug)]
pub struct QueryStream {
    pub body: Body,
    /// Resolves once the session has been released or discarded.
    pub completion: JoinHandle<()>,
}

enum Outcome {
    Completed(WriteSummary),
    NotStarted,
    Aborted(WriteError),
}

impl QueryExecutor {
    pub fn new(command_timeout: Duration, mode: ResultMode) -> Self {
        Self {
            command_timeout,
            mode,
        }
    }

    /// Execute `query` on `session` and stream the result as JSON.
    ///
    /// Ownership of `session` passes to the executor; it goes back to `pool`
    /// only if every row was written.
    pub async fn run(
        &self,
        pool: Arc<SessionPool>,
        mut session: PooledSession,
        query: &str,
        gzip: bool,
        cancel: CancellationToken,
    ) -> Result<QueryStream, QueryError> {
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let (started_tx, started_rx) = oneshot::channel();
        let body = Body::from_stream(CancelOnDrop {
            inner: ReceiverStream::new(body_rx),
            _guard: cancel.clone().drop_guard(),
        });

        let command = session.backend().create_command(query).with_timeout(self.command_timeout);
        let writer = ResultWriter::new(self.mode, gzip);
        let session_id = session.id();
        let executing = CancellationToken::new();

        let watcher = {
            let cancel = cancel.clone();
            let executing = executing.clone();
            let handle = session.cancel_handle();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = executing.cancelled() => {}
                    _ = cancel.cancelled() => {
                        info!(session = session_id, "request canceled during execution, canceling backend command");
                        let _ = tokio::task::spawn_blocking(move || handle.cancel()).await;
                    }
                }
            })
        };

        let task = {
            let cancel = cancel.clone();
            let executing = executing.clone();
            tokio::task::spawn_blocking(move || {
                let outcome = execute_and_write(
                    &mut session,
                    &command,
                    &writer,
                    ChannelWriter::new(body_tx),
                    started_tx,
                    &cancel,
                    &executing,
                );
                (session, outcome)
            })
        };

        let completion = tokio::spawn(async move {
            let joined = task.await;
            executing.cancel();
            let _ = watcher.await;
            match joined {
                Ok((session, Outcome::Completed(summary))) => {
                    debug!(session = session.id(), rows = summary.rows, "query complete, releasing session");
                    pool.release(session).await;
                }
                Ok((session, Outcome::NotStarted)) => pool.discard(session),
                Ok((session, Outcome::Aborted(e))) => {
                    warn!(session = session.id(), error = %e, "result stream aborted, discarding session");
                    pool.discard(session);
                }
                Err(e) => error!(session = session_id, error = %e, "query task panicked"),
            }
        });

        match started_rx.await {
            Ok(Ok(())) => Ok(QueryStream { body, completion }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(QueryError::Join("query task ended before reporting a result".into())),
        }
    }
}

fn execute_and_write(
    session: &mut PooledSession,
    command: &Command,
    writer: &ResultWriter,
    sink: ChannelWriter,
    started: oneshot::Sender<Result<(), QueryError>>,
    cancel: &CancellationToken,
    executing: &CancellationToken,
) -> Outcome {
    if cancel.is_cancelled() {
        let _ = started.send(Err(QueryError::Canceled));
        return Outcome::NotStarted;
    }

    let result = session.backend().execute(command);
    executing.cancel();

    let mut cursor = match result {
        Ok(_) if cancel.is_cancelled() => {
            let _ = started.send(Err(QueryError::Canceled));
            return Outcome::NotStarted;
        }
        Ok(cursor) => cursor,
        Err(e) => {
            let e = if cancel.is_cancelled() {
                QueryError::Canceled
            } else {
                QueryError::Backend(e)
            };
            warn!(error = %e, "query execution failed");
            let _ = started.send(Err(e));
            return Outcome::NotStarted;
        }
    };

    let _ = started.send(Ok(()));
    match writer.write(cursor.as_mut(), sink, cancel) {
        Ok(summary) => Outcome::Completed(summary),
        Err(e) => Outcome::Aborted(e),
    }
}

/// Response body stream that cancels the request token when dropped.
struct CancelOnDrop<S> {
    inner: S,
    _guard: DropGuard,
}

impl<S: Stream<Item = Result<Bytes, io::Error>> + Unpin> Stream for CancelOnDrop<S> {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgate_auth::{ConnectionDescriptor, Credential};
    use qgate_pool::{BackendError, CancelHandle, CellValue, Connector, PoolConfig, RowCursor, Session};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    // ── Mock backend ─────────────────────────────────────────────

    #[derive(Default)]
    struct Probe {
        disposes: AtomicU64,
        cancels: AtomicU64,
        canceled: AtomicBool,
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Rows(usize),
        Fail,
        /// Block in execute until the cancel handle fires.
        Hang,
    }

    struct MockSession {
        probe: Arc<Probe>,
        behavior: Behavior,
    }

    struct MockCancel(Arc<Probe>);

    impl CancelHandle for MockCancel {
        fn cancel(&self) {
            self.0.cancels.fetch_add(1, Ordering::SeqCst);
            self.0.canceled.store(true, Ordering::SeqCst);
        }
    }

    struct CountCursor {
        total: usize,
        pos: usize,
    }

    impl RowCursor for CountCursor {
        fn read(&mut self) -> Result<bool, BackendError> {
            if self.pos >= self.total {
                return Ok(false);
            }
            self.pos += 1;
            Ok(true)
        }

        fn field_count(&self) -> usize {
            1
        }

        fn name(&self, _index: usize) -> &str {
            "n"
        }

        fn value(&self, _index: usize) -> Result<CellValue, BackendError> {
            Ok(CellValue::Int(self.pos as i64))
        }
    }

    impl Session for MockSession {
        fn open(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        fn execute(&mut self, _command: &Command) -> Result<Box<dyn RowCursor + '_>, BackendError> {
            match self.behavior {
                Behavior::Rows(total) => Ok(Box::new(CountCursor { total, pos: 0 })),
                Behavior::Fail => Err(BackendError::Execution("syntax error near EVALUATE".into())),
                Behavior::Hang => {
                    while !self.probe.canceled.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(BackendError::Canceled)
                }
            }
        }

        fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
            Arc::new(MockCancel(Arc::clone(&self.probe)))
        }

        fn dispose(&mut self) {
            self.probe.disposes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockConnector {
        probe: Arc<Probe>,
        behavior: Behavior,
    }

    impl Connector for MockConnector {
        fn connect(&self, _descriptor: &ConnectionDescriptor) -> Result<Box<dyn Session>, BackendError> {
            Ok(Box::new(MockSession {
                probe: Arc::clone(&self.probe),
                behavior: self.behavior,
            }))
        }
    }

    async fn setup(behavior: Behavior) -> (Arc<SessionPool>, Arc<Probe>, PooledSession) {
        let probe = Arc::new(Probe::default());
        let connector = Arc::new(MockConnector {
            probe: Arc::clone(&probe),
            behavior,
        });
        let pool = Arc::new(SessionPool::new(PoolConfig::default(), connector));
        let session = pool.acquire(&key(), &Credential::None).await.unwrap();
        (pool, probe, session)
    }

    fn key() -> ConnectionDescriptor {
        ConnectionDescriptor::from_raw("Data Source=srv;Catalog=db;")
    }

    fn executor() -> QueryExecutor {
        QueryExecutor::new(Duration::from_secs(120), ResultMode::Streaming)
    }

    // ── Tests ────────────────────────────────────────────────────

    #[tokio::test]
    async fn successful_query_streams_and_releases() {
        let (pool, probe, session) = setup(Behavior::Rows(3)).await;
        let stream = executor()
            .run(pool.clone(), session, "EVALUATE t", false, CancellationToken::new())
            .await
            .unwrap();

        let body = axum::body::to_bytes(stream.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"[{"n":1},{"n":2},{"n":3}]"#);
        stream.completion.await.unwrap();

        assert_eq!(pool.idle_count(&key()).await, 1);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn execution_error_is_reported_and_session_discarded() {
        let (pool, probe, session) = setup(Behavior::Fail).await;
        let err = executor()
            .run(pool.clone(), session, "bad", false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Backend(_)));
        assert!(err.to_string().contains("syntax error"));

        // Completion is detached on error; wait for the discard to land.
        for _ in 0..100 {
            if pool.counters().discarded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.counters().discarded, 1);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(&key()).await, 0);
    }

    #[tokio::test]
    async fn canceled_before_start() {
        let (pool, probe, session) = setup(Behavior::Rows(3)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor()
            .run(pool.clone(), session, "EVALUATE t", false, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Canceled));

        for _ in 0..100 {
            if probe.disposes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_during_execute_invokes_backend_cancel() {
        let (pool, probe, session) = setup(Behavior::Hang).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = executor()
            .run(pool.clone(), session, "EVALUATE slow", false, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Canceled));
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_body_mid_stream_discards_session() {
        let (pool, probe, session) = setup(Behavior::Rows(1_000_000)).await;
        let stream = executor()
            .run(pool.clone(), session, "EVALUATE big", false, CancellationToken::new())
            .await
            .unwrap();

        // Client disconnect: the body is dropped before it is drained.
        drop(stream.body);
        stream.completion.await.unwrap();

        assert_eq!(pool.idle_count(&key()).await, 0);
        assert_eq!(pool.counters().discarded, 1);
        assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
        // Execution had already finished, so no backend cancel was sent.
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 0);
    }
}
