//! Appointment and usage-session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("scheduled"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Lifecycle of a single service inside an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl ServiceStatus {
    /// Whether a usage session may be opened for this service.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Scheduled | Self::InProgress)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("scheduled"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

/// One equipment-backed service within an appointment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentService {
    pub id: String,
    pub name: String,
    pub status: ServiceStatus,
    /// Estimated equipment minutes, from the service definition.
    pub estimated_minutes: i64,
    /// Whether the device may be powered off automatically when the
    /// estimate is reached.
    pub auto_shutdown: bool,
}

/// A booked appointment with its services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub tenant_id: String,
    pub status: AppointmentStatus,
    pub services: Vec<AppointmentService>,
}

impl Appointment {
    pub fn service(&self, service_id: &str) -> Option<&AppointmentService> {
        self.services.iter().find(|s| s.id == service_id)
    }
}

/// Lifecycle of a usage session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Accruing usage.
    Active,
    /// Device went dark mid-session; accrual is suspended.
    Paused,
    /// Closed normally (manual stop or observed power-off).
    Completed,
    /// Closed by the reconciler when the estimate was reached.
    AutoShutdown,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::AutoShutdown)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Paused => f.write_str("paused"),
            Self::Completed => f.write_str("completed"),
            Self::AutoShutdown => f.write_str("auto_shutdown"),
        }
    }
}

/// One device-usage session, gated by an appointment service.
///
/// `last_sample_at`/`last_sample_watts` are the reconciler's accrual
/// baseline; they reset whenever accrual must not bridge a gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSession {
    pub id: Uuid,
    pub appointment_id: String,
    pub service_id: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub estimated_minutes: i64,
    /// Minutes with measurable draw, accrued by the reconciler.
    pub active_minutes: f64,
    /// Energy accrued in kWh.
    pub energy_kwh: f64,
    pub status: SessionStatus,
    pub auto_shutdown: bool,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_sample_watts: Option<f64>,
}

impl UsageSession {
    pub fn open(
        appointment_id: impl Into<String>,
        service_id: impl Into<String>,
        device_id: impl Into<String>,
        estimated_minutes: i64,
        auto_shutdown: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            appointment_id: appointment_id.into(),
            service_id: service_id.into(),
            device_id: device_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            estimated_minutes,
            active_minutes: 0.0,
            energy_kwh: 0.0,
            status: SessionStatus::Active,
            auto_shutdown,
            last_sample_at: None,
            last_sample_watts: None,
        }
    }
}

/// Severity of a compliance alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Medium,
    High,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
        }
    }
}

/// Immutable audit entry for compliance and operational events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub device_id: String,
    pub kind: String,
    pub severity: AlertSeverity,
    pub overage_minutes: i64,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_eligibility() {
        assert!(ServiceStatus::Scheduled.can_start());
        assert!(ServiceStatus::InProgress.can_start());
        assert!(!ServiceStatus::Completed.can_start());
    }

    #[test]
    fn test_terminal_session_states() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::AutoShutdown.is_terminal());
    }
}
