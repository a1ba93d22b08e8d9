//! Session layer error types.

use std::time::Duration;

use thiserror::Error;

use crate::session::SavepointToken;

/// Boxed error produced by a concrete database driver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors a session provider can surface to the engine.
#[derive(Debug, Error)]
pub enum SessionError {
    /// no connection could be obtained from the pool
    #[error("connection unavailable: {0}")]
    Unavailable(String),

    /// the session was already closed
    #[error("session is closed")]
    Closed,

    /// the savepoint is unknown or already finalized
    #[error("savepoint {0} is not active")]
    UnknownSavepoint(SavepointToken),

    /// the operation did not complete in time
    #[error("session operation timed out after {0:?}")]
    Timeout(Duration),

    /// error from the underlying driver
    #[error("backend error: {0}")]
    Backend(#[from] BoxError),
}

impl SessionError {
    /// Wrap a driver error.
    pub fn backend(err: impl Into<BoxError>) -> Self {
        SessionError::Backend(err.into())
    }

    /// Whether retrying the whole unit of work may succeed.
    ///
    /// The engine never retries; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Unavailable(_) | SessionError::Timeout(_)
        )
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
