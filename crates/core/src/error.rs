//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// funds, duplicates, conflicts). Infrastructure failures (storage unavailable)
/// belong to the store error types in `wager-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request failed validation before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A lock/transfer/earn precondition on available funds failed.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    /// The user already has an active ticket in the lane.
    #[error("duplicate seek: {0}")]
    DuplicateSeek(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A ticket, match or account was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflict occurred (stale version, idempotency key reuse, terminal race).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn insufficient_funds(available: i64, requested: i64) -> Self {
        Self::InsufficientFunds {
            available,
            requested,
        }
    }

    pub fn duplicate_seek(msg: impl Into<String>) -> Self {
        Self::DuplicateSeek(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
