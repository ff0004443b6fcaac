//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
///
/// Transient authorizer failures never appear here: the resilience wrapper
/// turns them into a pending outcome.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A payment, refund or other record was not found.
    #[error("record not found: {0}")]
    NotFound(Uuid),

    /// The request conflicts with existing state (duplicate order, key reuse).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}
