//! qgate-api — HTTP query gateway.
//!
//! Authenticates the caller, checks out a pooled backend session, runs the
//! query, and streams the rows back as a JSON array.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/Query?query=..&gzip=..` | Run a query against the default database |
//! | POST | `/api/Query?gzip=..` | Same; the body is the query text |
//! | GET | `/api/{database}/Query?query=..&gzip=..` | Run a query against `database` |
//! | POST | `/api/{database}/Query?gzip=..` | Same; the body is the query text |
//! | GET | `/api/Databases` | List catalogs |
//! | GET | `/api/Tables`, `/api/{database}/Tables` | List tables |
//! | GET | `/api/Tables/{table}`, `/api/{database}/Tables/{table}` | Dump one table |
//! | GET | `/api/pool/stats` | Idle sessions and checkout metrics (secrets masked) |
//! | GET | `/healthz` | Liveness |

pub mod error;
pub mod executor;
pub mod handlers;
pub mod queries;
pub mod writer;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use qgate_auth::{DescriptorBuilder, TokenIssuer};
use qgate_core::{ConfigError, GatewayConfig};
use qgate_pool::{PoolConfig, SessionPool};
use tower_http::trace::TraceLayer;

pub use error::{ApiError, QueryError, WriteError};
pub use executor::{QueryExecutor, QueryStream};
pub use writer::{ChannelWriter, ResultWriter, WriteSummary};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<GatewayConfig>,
    pub builder: Arc<DescriptorBuilder>,
    pub pool: Arc<SessionPool>,
    pub executor: QueryExecutor,
}

impl ApiState {
    pub fn new(
        config: GatewayConfig,
        issuer: Arc<dyn TokenIssuer>,
        pool: Arc<SessionPool>,
    ) -> Result<Self, ConfigError> {
        let builder = DescriptorBuilder::from_config(&config, issuer);
        let executor = QueryExecutor::new(config.command_timeout()?, config.query.result_mode);
        Ok(Self {
            config: Arc::new(config),
            builder: Arc::new(builder),
            pool,
            executor,
        })
    }
}

/// Pool settings from the `[pool]` config section.
pub fn pool_config(config: &GatewayConfig) -> Result<PoolConfig, ConfigError> {
    Ok(PoolConfig {
        guard_window: config.guard_window()?,
        default_validity: config.default_validity()?,
    })
}

/// Build the complete gateway router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/Query", get(handlers::query_default).post(handlers::post_query_default))
        .route("/api/{database}/Query", get(handlers::query).post(handlers::post_query))
        .route("/api/Databases", get(handlers::databases))
        .route("/api/Tables", get(handlers::tables_default))
        .route("/api/{database}/Tables", get(handlers::tables))
        .route("/api/Tables/{table}", get(handlers::table_default))
        .route("/api/{database}/Tables/{table}", get(handlers::table))
        .route("/api/pool/stats", get(handlers::pool_stats))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
