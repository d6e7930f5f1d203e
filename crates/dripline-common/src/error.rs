//! Error types for Dripline

use thiserror::Error;

/// Main error type for Dripline
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Rejected synchronously, never retried, surfaced verbatim.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Distinguishable from validation so callers can show a specific
    /// message (duplicate name, reactivating a completed campaign).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Hard quota failure: even day-zero quota is 0. Partial grants
    /// are not errors, they are reported in materialization outcomes.
    #[error("Daily send quota exhausted for user {user_id}")]
    QuotaExhausted { user_id: uuid::Uuid },

    /// Programming/logic errors: double materialization of a
    /// (step, contact) pair, reply step resolved before its target,
    /// reserving quota for a past day. Fail loudly, never skip.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Dripline
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Validation(_) => 422,
            Error::Conflict(_) => 409,
            Error::NotFound(_) => 404,
            Error::QuotaExhausted { .. } => 429,
            Error::Integrity(_) => 500,
            Error::Dispatch(_) => 502,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Conflict(_) => "CONFLICT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::QuotaExhausted { .. } => "QUOTA_EXHAUSTED",
            Error::Integrity(_) => "INTEGRITY_VIOLATION",
            Error::Dispatch(_) => "DISPATCH_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}
