//! Ledger error with retry classification.

use thiserror::Error;

/// Error returned by ledger operations.
///
/// `retryable` tells callers whether the operation may succeed if repeated:
/// busy/locked databases and connection failures are retryable; constraint
/// violations, missing rows, and malformed data are permanent. A permanent
/// error with `conflict` set means a uniqueness constraint rejected the
/// write, which callers handle with their own conflict policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation}: {message}")]
pub struct LedgerError {
    /// Operation that failed (e.g. "insert_action", "complete_action").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
    pub conflict: bool,
}

impl LedgerError {
    /// A transient error that may succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
            conflict: false,
        }
    }

    /// A permanent error that will not succeed on retry.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            conflict: false,
        }
    }

    /// A uniqueness-constraint rejection.
    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            conflict: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict
    }
}
