//! Ledger error model.

use thiserror::Error;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-level error.
///
/// Backends translate their own failures into one of these variants so the
/// transactions above them (and the callers above those) can branch on the
/// category without knowing which store produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A referenced account, user or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself is unacceptable (non-positive amount, currency
    /// mismatch, insufficient funds, malformed identifier).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A uniqueness rule was violated (duplicate username, email, or
    /// owner/currency pair).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend aborted the scope because of concurrent access and the
    /// same work may succeed if run again (serialization failure, deadlock
    /// detection, lock timeout).
    #[error("retryable conflict: {0}")]
    Retryable(String),

    /// A verification secret was wrong, already consumed or expired.
    #[error("mismatch: {0}")]
    Mismatch(String),

    /// Storage or transport failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The scope failed and aborting it failed as well.
    #[error("tx err: {tx}, rollback err: {rollback}")]
    RollbackFailed {
        tx: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },
}

/// Coarse classification used at the API boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Conflict,
    Internal,
}

impl LedgerError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::Mismatch(msg.into())
    }

    pub fn internal(msg: impl ToString) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Combine a scope failure with the failure to abort it.
    pub fn rollback_failed(tx: LedgerError, rollback: LedgerError) -> Self {
        Self::RollbackFailed {
            tx: Box::new(tx),
            rollback: Box::new(rollback),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput(_) | Self::Mismatch(_) => ErrorKind::BadRequest,
            Self::Conflict(_) | Self::Retryable(_) => ErrorKind::Conflict,
            Self::Internal(_) | Self::RollbackFailed { .. } => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_failure_keeps_both_messages() {
        let err = LedgerError::rollback_failed(
            LedgerError::invalid_input("insufficient funds"),
            LedgerError::internal("connection reset"),
        );

        let msg = err.to_string();
        assert!(msg.contains("insufficient funds"));
        assert!(msg.contains("connection reset"));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn kinds_follow_boundary_mapping() {
        assert_eq!(LedgerError::not_found("account 1").kind(), ErrorKind::NotFound);
        assert_eq!(LedgerError::invalid_input("x").kind(), ErrorKind::BadRequest);
        assert_eq!(LedgerError::mismatch("x").kind(), ErrorKind::BadRequest);
        assert_eq!(LedgerError::conflict("x").kind(), ErrorKind::Conflict);
        assert_eq!(LedgerError::retryable("x").kind(), ErrorKind::Conflict);
        assert_eq!(LedgerError::internal("x").kind(), ErrorKind::Internal);
    }
}
