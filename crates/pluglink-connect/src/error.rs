//! Error types for the connection layer.

use thiserror::Error;

/// Result type for connection operations.
pub type ConnectResult<T> = Result<T, ConnectError>;

/// Error type for connection and transport operations.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Transport could not be opened or broke mid-flight.
    #[error("transport error: {0}")]
    Transport(String),

    /// A connect attempt did not complete within the configured timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The connection id is unknown to the manager.
    #[error("connection not found: {0}")]
    NotFound(uuid::Uuid),

    /// The connection is in a state that does not allow the operation.
    #[error("connection {id} is {status}, cannot {operation}")]
    InvalidState {
        id: uuid::Uuid,
        status: String,
        operation: &'static str,
    },

    /// The connection's pending-message quota is exhausted.
    #[error("outbound queue full for connection {0}")]
    QueueFull(uuid::Uuid),

    /// Credential refresh failed; the caller must re-authenticate.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
