//! Error types for the device layer.

use thiserror::Error;

/// Result type for adapter parsing and payload building.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Result type for device commands.
pub type CommandResult<T> = Result<T, CommandError>;

/// Errors from protocol adapters.
///
/// Malformed inbound payloads are logged and dropped by callers; they never
/// tear down a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload did not match the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The device generation does not support this operation.
    #[error("operation not supported by this generation: {0}")]
    Unsupported(&'static str),
}

/// Errors from issuing a command to a device.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Local-network attempt failed (expected when the device roams).
    #[error("local command failed: {0}")]
    Local(String),

    /// Cloud attempt failed.
    #[error("cloud command failed: {0}")]
    Cloud(String),

    /// Neither path answered within its timeout.
    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Cloud rejected the credential even after a refresh.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The device returned an RPC-level error.
    #[error("device rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Adapter could not build or parse the payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
