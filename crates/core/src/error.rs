//! Validation error model.

use thiserror::Error;

/// Result type used when building jobs.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// A unit of work was rejected before it reached the queue.
///
/// Validation is structural only: the payload itself is opaque to the queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload is not a JSON object (e.g. `null`, an array, a scalar).
    #[error("payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),

    /// A caller-supplied job identifier is unusable as a storage key.
    #[error("invalid job id: {0}")]
    InvalidId(String),

    /// A caller-supplied idempotency key is unusable as a header value.
    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),
}

impl ValidationError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidIdempotencyKey(msg.into())
    }
}
