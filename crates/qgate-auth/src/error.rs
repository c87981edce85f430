//! Error types for credential resolution and descriptor building.

use thiserror::Error;

/// Result type alias for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur while turning a request credential into a connection descriptor.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("anonymous access is only allowed for on-prem servers")]
    AnonymousNotAllowed,

    #[error("no tenant id available to exchange a token for client {0}")]
    MissingTenant(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("malformed bearer token: {0}")]
    MalformedToken(String),
}
