//! Error types for the chemist fleet model.

use thiserror::Error;

/// Result type alias for repository operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while mutating the fleet model.
#[derive(Debug, Error)]
pub enum StateError {
    /// A flask with this id is already registered and not terminated.
    #[error("flask already known: {0}")]
    AlreadyKnown(String),

    #[error("unknown flask: {0}")]
    UnknownFlask(String),
}
