//! Lifecycle error types.

use thiserror::Error;

use chemist_discovery::DiscoveryError;
use chemist_state::StateError;

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors that can occur while interpreting lifecycle messages.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The message body is not a usable lifecycle event. The message is
    /// still deleted from the queue so a poison pill cannot wedge the loop.
    #[error("message parse error: {0}")]
    MessageParse(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("queue error: {0}")]
    Queue(String),
}
