//! Error types for the session layer.

use thiserror::Error;
use uuid::Uuid;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Business-rule rejections. These are values the caller acts on, never
/// panics.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("appointment {appointment_id} is {status}, not in progress")]
    AppointmentNotInProgress {
        appointment_id: String,
        status: String,
    },

    #[error("service {service_id} is {status}, not eligible to start")]
    ServiceNotEligible { service_id: String, status: String },

    #[error("device {device_id} already has session {session_id} open")]
    SessionAlreadyActive { device_id: String, session_id: Uuid },

    #[error("session {0} is already closed")]
    SessionClosed(Uuid),

    #[error("unknown appointment {0}")]
    UnknownAppointment(String),

    #[error("appointment {appointment_id} has no service {service_id}")]
    UnknownService {
        appointment_id: String,
        service_id: String,
    },

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("unknown session {0}")]
    UnknownSession(Uuid),
}

/// Error type for session and control operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A business rule rejected the request.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The device command failed on both paths.
    #[error(transparent)]
    Command(#[from] pluglink_devices::CommandError),

    /// A persistence collaborator failed.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}
