//! Shared mocks for router-level tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use qgate_api::{ApiState, build_router, pool_config};
use qgate_auth::{AuthError, AuthResult, ConnectionDescriptor, TokenIssuer};
use qgate_core::GatewayConfig;
use qgate_pool::{BackendError, CancelHandle, CellValue, Command, Connector, RowCursor, Session, SessionPool};

pub const TENANT: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";
pub const CLIENT_ID: &str = "0b8f3c1e-4d2a-4b7e-9f0a-1c2d3e4f5a6b";

// ── Recorder ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct Recorder {
    pub connects: AtomicU64,
    pub disposes: AtomicU64,
    pub commands: Mutex<Vec<Command>>,
    pub descriptors: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disposes(&self) -> u64 {
        self.disposes.load(Ordering::SeqCst)
    }

    pub fn last_command(&self) -> Option<Command> {
        self.commands.lock().unwrap().last().cloned()
    }

    pub fn last_descriptor(&self) -> Option<String> {
        self.descriptors.lock().unwrap().last().cloned()
    }
}

// ── Backend mock ─────────────────────────────────────────────────
//
// Query text drives the result: "FAIL" errors, "EMPTY" returns no rows,
// "ROWS n" returns n rows, anything else returns three.

struct MockConnector {
    recorder: Arc<Recorder>,
}

impl Connector for MockConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn Session>, BackendError> {
        self.recorder
            .descriptors
            .lock()
            .unwrap()
            .push(descriptor.as_str().to_string());
        if descriptor.field("User Id").as_deref() == Some("nobody") {
            return Err(BackendError::Connection(format!("login failed for {descriptor}")));
        }
        self.recorder.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

struct MockSession {
    recorder: Arc<Recorder>,
}

struct NoopCancel;

impl CancelHandle for NoopCancel {
    fn cancel(&self) {}
}

impl Session for MockSession {
    fn open(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> Result<Box<dyn RowCursor + '_>, BackendError> {
        self.recorder.commands.lock().unwrap().push(command.clone());
        let text = command.text.trim();
        if text.contains("FAIL") {
            return Err(BackendError::Execution("query failed: FAIL is not a function".into()));
        }
        let total = if text.contains("EMPTY") {
            0
        } else if let Some(n) = text.strip_prefix("ROWS ") {
            n.trim().parse().unwrap_or(0)
        } else {
            3
        };
        Ok(Box::new(TableCursor { total, pos: 0 }))
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(NoopCancel)
    }

    fn dispose(&mut self) {
        self.recorder.disposes.fetch_add(1, Ordering::SeqCst);
    }
}

struct TableCursor {
    total: usize,
    pos: usize,
}

impl RowCursor for TableCursor {
    fn read(&mut self) -> Result<bool, BackendError> {
        if self.pos >= self.total {
            return Ok(false);
        }
        self.pos += 1;
        Ok(true)
    }

    fn field_count(&self) -> usize {
        2
    }

    fn name(&self, index: usize) -> &str {
        ["Product[Key]", "Product[Name]"][index]
    }

    fn value(&self, index: usize) -> Result<CellValue, BackendError> {
        Ok(match index {
            0 => CellValue::Int(self.pos as i64),
            _ => CellValue::Text(format!("Widget {}", self.pos)),
        })
    }
}

// ── Token issuer mock ────────────────────────────────────────────

pub struct MockIssuer {
    pub calls: AtomicU64,
}

pub fn unsigned_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}

pub fn issued_token() -> String {
    unsigned_jwt(4_102_444_800)
}

#[async_trait]
impl TokenIssuer for MockIssuer {
    async fn exchange(&self, _client_id: &str, secret: &str, _tenant_id: &str) -> AuthResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if secret == "wrong" {
            return Err(AuthError::TokenExchange("400 Bad Request: AADSTS7000215".into()));
        }
        Ok(issued_token())
    }
}

// ── Harness ──────────────────────────────────────────────────────

pub struct TestApp {
    pub router: Router,
    pub pool: Arc<SessionPool>,
    pub recorder: Arc<Recorder>,
    pub issuer: Arc<MockIssuer>,
}

impl TestApp {
    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        use tower::ServiceExt;
        self.router.clone().oneshot(req).await.unwrap()
    }

    /// Wait for the background release or discard of `n` sessions.
    pub async fn settle(&self, n: u64) {
        for _ in 0..200 {
            let c = self.pool.counters();
            if c.released + c.discarded >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sessions did not settle: {:?}", self.pool.counters());
    }
}

pub fn cloud_config() -> GatewayConfig {
    GatewayConfig::for_server("asazure://westus.asazure.windows.net/srv", "AdventureWorks", TENANT)
}

pub fn onprem_config() -> GatewayConfig {
    GatewayConfig::for_server("localhost:5432", "AdventureWorks", TENANT)
}

pub fn app(config: GatewayConfig) -> TestApp {
    let recorder = Arc::new(Recorder::default());
    let issuer = Arc::new(MockIssuer {
        calls: AtomicU64::new(0),
    });
    let connector = Arc::new(MockConnector {
        recorder: Arc::clone(&recorder),
    });
    let pool = Arc::new(SessionPool::new(pool_config(&config).unwrap(), connector));
    let state = ApiState::new(config, issuer.clone(), pool.clone()).unwrap();
    TestApp {
        router: build_router(state),
        pool,
        recorder,
        issuer,
    }
}

pub fn basic(user: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{secret}")))
}

pub async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), 64 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(resp: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}
