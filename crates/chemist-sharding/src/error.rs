//! Sharding and distribution error types.

use thiserror::Error;

/// Result type alias for sharding operations.
pub type ShardingResult<T> = Result<T, ShardingError>;

/// Errors that can occur while pushing assignments to flasks.
#[derive(Debug, Error)]
pub enum ShardingError {
    /// The flask answered 4xx: the assignment itself is bad and retrying
    /// cannot help.
    #[error("assignment rejected by flask {flask}: status {status}")]
    AssignmentRejected { flask: String, status: u16 },

    /// Retries exhausted on 5xx or network errors.
    #[error("flask unreachable: {0}")]
    FlaskUnreachable(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}
