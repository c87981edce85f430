//! Query API handlers.
//!
//! Every query route funnels into [`run_query`]: resolve the credential, pick
//! the transport policy, build the descriptor, check out a session, and hand
//! it to the executor.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Uri, header};
use axum::response::{IntoResponse, Response};
use qgate_auth::{AuthError, Credential};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ApiState;
use crate::error::ApiError;
use crate::queries;

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub query: Option<String>,
    pub gzip: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GzipParam {
    pub gzip: Option<bool>,
}

// ── Query ──────────────────────────────────────────────────────

/// GET /api/Query
pub async fn query_default(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let query = params.query.unwrap_or_default();
    run_query(&state, &headers, &uri, None, &query, params.gzip.unwrap_or(false)).await
}

/// GET /api/{database}/Query
pub async fn query(
    State(state): State<ApiState>,
    Path(database): Path<String>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let query = params.query.unwrap_or_default();
    run_query(&state, &headers, &uri, Some(&database), &query, params.gzip.unwrap_or(false)).await
}

/// POST /api/Query
pub async fn post_query_default(
    State(state): State<ApiState>,
    Query(params): Query<GzipParam>,
    headers: HeaderMap,
    uri: Uri,
    body: String,
) -> Result<Response, ApiError> {
    run_query(&state, &headers, &uri, None, &body, params.gzip.unwrap_or(false)).await
}

/// POST /api/{database}/Query
pub async fn post_query(
    State(state): State<ApiState>,
    Path(database): Path<String>,
    Query(params): Query<GzipParam>,
    headers: HeaderMap,
    uri: Uri,
    body: String,
) -> Result<Response, ApiError> {
    run_query(&state, &headers, &uri, Some(&database), &body, params.gzip.unwrap_or(false)).await
}

// ── Catalog ────────────────────────────────────────────────────

/// GET /api/Databases
pub async fn databases(
    State(state): State<ApiState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    run_query(&state, &headers, &uri, None, queries::DATABASES_QUERY, false).await
}

/// GET /api/Tables
pub async fn tables_default(
    State(state): State<ApiState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    run_query(&state, &headers, &uri, None, queries::TABLES_QUERY, false).await
}

/// GET /api/{database}/Tables
pub async fn tables(
    State(state): State<ApiState>,
    Path(database): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    run_query(&state, &headers, &uri, Some(&database), queries::TABLES_QUERY, false).await
}

/// GET /api/Tables/{table}
pub async fn table_default(
    State(state): State<ApiState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let query = table_query(&table)?;
    run_query(&state, &headers, &uri, None, &query, false).await
}

/// GET /api/{database}/Tables/{table}
pub async fn table(
    State(state): State<ApiState>,
    Path((database, table)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let query = table_query(&table)?;
    run_query(&state, &headers, &uri, Some(&database), &query, false).await
}

fn table_query(table: &str) -> Result<String, ApiError> {
    queries::table_query(table).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "table name exceeds {} characters when quoted",
            queries::MAX_QUOTED_NAME
        ))
    })
}

// ── Operational ────────────────────────────────────────────────

/// GET /api/pool/stats
pub async fn pool_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.pool.stats().await)
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

// ── Shared pipeline ────────────────────────────────────────────

/// Whether the request arrived over TLS, directly or via a trusted proxy.
///
/// `axum::serve` hands handlers origin-form URIs, so the scheme check only
/// matches absolute-form request targets. Behind a TLS-terminating proxy,
/// Basic auth needs `auth.trust_forwarded_proto`.
pub fn is_encrypted(uri: &Uri, headers: &HeaderMap, trust_forwarded_proto: bool) -> bool {
    if uri.scheme_str() == Some("https") {
        return true;
    }
    trust_forwarded_proto
        && headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

async fn run_query(
    state: &ApiState,
    headers: &HeaderMap,
    uri: &Uri,
    database: Option<&str>,
    query: &str,
    gzip: bool,
) -> Result<Response, ApiError> {
    let database = database
        .filter(|db| !db.is_empty())
        .or_else(|| state.config.default_database())
        .ok_or_else(|| {
            ApiError::BadRequest("database not specified in route and no default database configured".into())
        })?;
    if query.trim().is_empty() {
        return Err(ApiError::BadRequest("query is required".into()));
    }

    let credential = Credential::resolve(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    );
    let encrypted = is_encrypted(uri, headers, state.config.auth.trust_forwarded_proto);

    if credential.is_none() && !state.builder.allows_anonymous() {
        info!(encrypted, "returning 401 authentication challenge");
        return Err(ApiError::Unauthorized {
            realm: state.config.auth.realm.clone(),
            offer_basic: encrypted,
        });
    }
    if matches!(credential, Credential::Basic { .. }) && !encrypted {
        info!("rejecting basic auth over an unencrypted connection");
        return Err(ApiError::BadRequest(
            "HTTP Basic auth is only supported with https requests".into(),
        ));
    }

    let descriptor = state
        .builder
        .build(&credential, database)
        .await
        .inspect_err(|e| match e {
            AuthError::TokenExchange(_) => {
                error!(scheme = credential.scheme(), error = %e, "service principal token exchange failed")
            }
            _ => warn!(scheme = credential.scheme(), error = %e, "failed to build connection descriptor"),
        })?;

    let session = state
        .pool
        .acquire(&descriptor, &credential)
        .await
        .inspect_err(|e| error!(descriptor = %descriptor, error = %e, "failed to get backend session"))?;

    info!(
        database,
        scheme = credential.scheme(),
        session = session.id(),
        gzip,
        "executing query"
    );
    debug!(query_len = query.len(), "query text received");

    let stream = state
        .executor
        .run(state.pool.clone(), session, query, gzip, CancellationToken::new())
        .await?;

    let mut response = Response::new(stream.body);
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    if gzip {
        response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    Ok(response)
}
