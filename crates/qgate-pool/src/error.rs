//! Error types for backend sessions and the session pool.

use thiserror::Error;

/// Errors reported by a backend session.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Execution(String),

    #[error("query canceled")]
    Canceled,
}

/// Errors that can occur while acquiring a pooled session.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("session task failed: {0}")]
    Join(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
