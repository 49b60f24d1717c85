//! Discovery error types.

use thiserror::Error;

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while looking up instance metadata.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The instance is gone. Racing a Terminate event is expected.
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("cloud lookup failed: {0}")]
    Lookup(String),
}
