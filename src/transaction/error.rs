//! Transaction error types.

use std::error::Error as StdError;

use thiserror::Error;

use crate::session::{BoxError, SessionError, SessionOp};

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// The requested propagation mode cannot run in the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PropagationViolation {
    /// `MANDATORY` was requested but no transaction is active.
    #[error("propagation MANDATORY requires an active transaction, but none exists")]
    NoActiveTransaction,

    /// `NEVER` was requested while a transaction is active.
    #[error("propagation NEVER forbids an active transaction, but one exists")]
    TransactionNotAllowed,
}

/// Errors that can occur at a transaction boundary.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The propagation mode rejected the entry. Nothing was done.
    #[error("propagation violation: {0}")]
    Propagation(#[from] PropagationViolation),

    /// Opening a session, beginning a transaction or creating a savepoint failed.
    #[error("could not start transaction: {op} failed: {source}")]
    Begin {
        op: SessionOp,
        source: SessionError,
    },

    /// Commit or savepoint release failed.
    #[error("{op} failed: {source}{}", original_suffix(.original))]
    Commit {
        op: SessionOp,
        source: SessionError,
        /// Error of the unit of work, when it also failed.
        original: Option<Box<TransactionError>>,
    },

    /// Rollback (to a savepoint or of the whole transaction) failed.
    #[error("{op} failed: {source}{}", original_suffix(.original))]
    Rollback {
        op: SessionOp,
        source: SessionError,
        original: Option<Box<TransactionError>>,
    },

    /// Closing an owned session failed.
    #[error("close failed: {source}{}", original_suffix(.original))]
    Close {
        source: SessionError,
        original: Option<Box<TransactionError>>,
    },

    /// The unit of work succeeded but a participant marked the
    /// transaction rollback-only, so it was rolled back.
    #[error("transaction was rolled back because a participant marked it rollback-only")]
    UnexpectedRollback,

    /// The frame registry is in a state the boundary never produces.
    #[error("transaction registry integrity violated: {0}")]
    Integrity(String),

    /// The unit of work itself failed.
    #[error("unit of work failed: {0}")]
    Unit(#[source] BoxError),
}

fn original_suffix(original: &Option<Box<TransactionError>>) -> String {
    match original {
        Some(err) => format!(" (while handling: {})", err),
        None => String::new(),
    }
}

impl From<SessionError> for TransactionError {
    fn from(err: SessionError) -> Self {
        TransactionError::Unit(Box::new(err))
    }
}

impl TransactionError {
    /// Wrap an error raised by a unit of work.
    pub fn unit(err: impl Into<BoxError>) -> Self {
        TransactionError::Unit(err.into())
    }

    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        TransactionError::Integrity(msg.into())
    }

    /// The error of the unit of work that was being handled when
    /// finalization failed.
    pub fn original(&self) -> Option<&TransactionError> {
        match self {
            TransactionError::Commit { original, .. }
            | TransactionError::Rollback { original, .. }
            | TransactionError::Close { original, .. } => original.as_deref(),
            _ => None,
        }
    }

    /// The boxed error of a failed unit of work.
    pub fn unit_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            TransactionError::Unit(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Find an error of type `T` raised by a unit of work, looking through
    /// the source chain and any chained original error.
    pub fn find_unit_error<T: StdError + 'static>(&self) -> Option<&T> {
        if let Some(err) = self.unit_error() {
            let first: &(dyn StdError + 'static) = err;
            let mut current = Some(first);
            while let Some(e) = current {
                if let Some(found) = e.downcast_ref::<T>() {
                    return Some(found);
                }
                current = e.source();
            }
        }
        self.original().and_then(|o| o.find_unit_error::<T>())
    }

    /// Check if this error was raised before any side effect.
    pub fn is_propagation_violation(&self) -> bool {
        matches!(self, TransactionError::Propagation(_))
    }

    /// Check if this error comes from commit, rollback or close.
    pub fn is_finalization_failure(&self) -> bool {
        matches!(
            self,
            TransactionError::Commit { .. }
                | TransactionError::Rollback { .. }
                | TransactionError::Close { .. }
        )
    }

    /// Check if retrying the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::Begin { source, .. } | TransactionError::Commit { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }
}
