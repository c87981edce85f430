//! Request-boundary errors and their HTTP mapping.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use qgate_auth::AuthError;
use qgate_pool::{BackendError, PoolError};
use serde::Serialize;
use thiserror::Error;

/// Errors from running a query, reported before any response byte is written.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("query canceled")]
    Canceled,

    #[error("query task failed: {0}")]
    Join(String),
}

/// Errors raised while writing rows to the response body.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("response write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("result truncated by cancellation")]
    Canceled,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized { realm: String, offer_basic: bool },

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to acquire backend session: {0}")]
    Session(#[from] PoolError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Problem-details body (RFC 7807 subset).
#[derive(Serialize)]
struct Problem {
    title: String,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn problem(status: StatusCode, title: &str, detail: Option<String>) -> Response {
    let mut response = (
        status,
        Json(Problem {
            title: title.to_string(),
            status: status.as_u16(),
            detail,
        }),
    )
        .into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/problem+json"),
    );
    response
}

fn challenge(scheme: &str, realm: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("{scheme} realm=\"{realm}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("Bearer"))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized { realm, offer_basic } => {
                let mut response = problem(StatusCode::UNAUTHORIZED, "Authentication required", None);
                let headers = response.headers_mut();
                headers.append(header::WWW_AUTHENTICATE, challenge("Bearer", &realm));
                if offer_basic {
                    headers.append(header::WWW_AUTHENTICATE, challenge("Basic", &realm));
                }
                response
            }
            ApiError::BadRequest(msg) => problem(StatusCode::BAD_REQUEST, "Bad request", Some(msg)),
            ApiError::Auth(e @ AuthError::AnonymousNotAllowed) => {
                problem(StatusCode::UNAUTHORIZED, "Credential not accepted", Some(e.to_string()))
            }
            // A failed exchange is reported like any other failure to reach the backend.
            ApiError::Auth(AuthError::TokenExchange(_)) | ApiError::Session(_) => problem(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to get backend connection. See server log for details.",
                None,
            ),
            ApiError::Auth(e) => problem(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to build backend connection",
                Some(e.to_string()),
            ),
            ApiError::Query(e) => problem(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Query execution failed",
                Some(e.to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_offers_basic_only_when_encrypted() {
        let plain = ApiError::Unauthorized {
            realm: "*.example".into(),
            offer_basic: false,
        }
        .into_response();
        assert_eq!(plain.status(), StatusCode::UNAUTHORIZED);
        let values: Vec<_> = plain.headers().get_all(header::WWW_AUTHENTICATE).iter().collect();
        assert_eq!(values, vec!["Bearer realm=\"*.example\""]);

        let tls = ApiError::Unauthorized {
            realm: "*.example".into(),
            offer_basic: true,
        }
        .into_response();
        let values: Vec<_> = tls.headers().get_all(header::WWW_AUTHENTICATE).iter().collect();
        assert_eq!(values, vec!["Bearer realm=\"*.example\"", "Basic realm=\"*.example\""]);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Auth(AuthError::AnonymousNotAllowed).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Auth(AuthError::TokenExchange("401".into())).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Auth(AuthError::MissingTenant("c".into())).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Session(PoolError::Join("boom".into())).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Query(QueryError::Canceled).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn token_exchange_failure_hides_directory_detail() {
        let response =
            ApiError::Auth(AuthError::TokenExchange("AADSTS7000215: invalid client secret".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["title"], "Failed to get backend connection. See server log for details.");
        assert!(body.get("detail").is_none());
        assert!(!body.to_string().contains("AADSTS"));
    }

    #[test]
    fn problem_body_is_problem_json() {
        let response = ApiError::BadRequest("missing query".into()).into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
