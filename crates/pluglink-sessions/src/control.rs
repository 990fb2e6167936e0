//! Appointment-gated device control.
//!
//! Power-on is only granted when the booking justifies it: the appointment
//! must be in progress and the named service eligible, and a device can
//! carry at most one open session. Validation failures are returned values;
//! compliance overages produce an audit record and an alert event, never a
//! blocking error.

use crate::error::{SessionError, SessionResult, ValidationError};
use crate::model::{AlertSeverity, AuditRecord, SessionStatus, UsageSession};
use crate::store::{AuditLog, DeviceStore, UsageStore};
use async_trait::async_trait;
use chrono::Utc;
use pluglink_core::config::usage;
use pluglink_core::{EventBus, PlugLinkEvent};
use pluglink_devices::{
    CommandResult, DeviceCommander, DeviceHandle, DeviceStatus, IndicatorMode,
};
use std::sync::Arc;
use uuid::Uuid;

const EVENT_SOURCE: &str = "device_control";

/// The slice of the commander the session layer needs.
///
/// A seam for tests; production hands in a [`DeviceCommander`].
#[async_trait]
pub trait PlugCommands: Send + Sync {
    async fn power(&self, handle: &DeviceHandle, on: bool) -> CommandResult<()>;
    async fn status(&self, handle: &DeviceHandle) -> CommandResult<DeviceStatus>;
    async fn reset_counters(&self, handle: &DeviceHandle) -> CommandResult<()>;
    async fn set_indicator(&self, handle: &DeviceHandle, mode: IndicatorMode) -> CommandResult<()>;
}

#[async_trait]
impl PlugCommands for DeviceCommander {
    async fn power(&self, handle: &DeviceHandle, on: bool) -> CommandResult<()> {
        DeviceCommander::power(self, handle, on, None).await
    }

    async fn status(&self, handle: &DeviceHandle) -> CommandResult<DeviceStatus> {
        DeviceCommander::status(self, handle).await
    }

    async fn reset_counters(&self, handle: &DeviceHandle) -> CommandResult<()> {
        DeviceCommander::reset_counters(self, handle).await
    }

    async fn set_indicator(&self, handle: &DeviceHandle, mode: IndicatorMode) -> CommandResult<()> {
        DeviceCommander::set_indicator(self, handle, mode).await
    }
}

/// Validates bookings and drives the plug around session boundaries.
pub struct DeviceControlService {
    commands: Arc<dyn PlugCommands>,
    devices: Arc<dyn DeviceStore>,
    usage: Arc<dyn UsageStore>,
    audit: Arc<dyn AuditLog>,
    bus: EventBus,
}

impl DeviceControlService {
    pub fn new(
        commands: Arc<dyn PlugCommands>,
        devices: Arc<dyn DeviceStore>,
        usage: Arc<dyn UsageStore>,
        audit: Arc<dyn AuditLog>,
        bus: EventBus,
    ) -> Self {
        Self {
            commands,
            devices,
            usage,
            audit,
            bus,
        }
    }

    /// Gate and execute a power-on. Returns the new session id.
    pub async fn validate_and_turn_on(
        &self,
        device_id: &str,
        appointment_id: &str,
        service_id: &str,
    ) -> SessionResult<Uuid> {
        let appointment = self
            .usage
            .appointment(appointment_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| ValidationError::UnknownAppointment(appointment_id.to_string()))?;

        if appointment.status != crate::model::AppointmentStatus::InProgress {
            return Err(ValidationError::AppointmentNotInProgress {
                appointment_id: appointment_id.to_string(),
                status: appointment.status.to_string(),
            }
            .into());
        }

        let service = appointment
            .service(service_id)
            .ok_or_else(|| ValidationError::UnknownService {
                appointment_id: appointment_id.to_string(),
                service_id: service_id.to_string(),
            })?;
        if !service.status.can_start() {
            return Err(ValidationError::ServiceNotEligible {
                service_id: service_id.to_string(),
                status: service.status.to_string(),
            }
            .into());
        }

        if let Some(open) = self
            .usage
            .active_session_for_device(device_id)
            .await
            .map_err(SessionError::Store)?
        {
            return Err(ValidationError::SessionAlreadyActive {
                device_id: device_id.to_string(),
                session_id: open.id,
            }
            .into());
        }

        let handle = self
            .devices
            .device(device_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))?;

        // Best effort: a plug whose counter cannot be reset still serves
        // the appointment, the baseline just starts nonzero
        if let Err(e) = self.commands.reset_counters(&handle).await {
            tracing::warn!(device_id, error = %e, "energy counter reset failed");
        }

        self.commands.power(&handle, true).await?;

        let session = UsageSession::open(
            appointment_id,
            service_id,
            device_id,
            service.estimated_minutes,
            service.auto_shutdown,
        );
        self.usage
            .create_session(&session)
            .await
            .map_err(SessionError::Store)?;

        if let Err(e) = self
            .commands
            .set_indicator(&handle, IndicatorMode::Session)
            .await
        {
            tracing::debug!(device_id, error = %e, "session indicator not set");
        }

        tracing::info!(
            device_id,
            session_id = %session.id,
            appointment_id,
            "usage session opened"
        );
        self.bus.publish_with_source(
            PlugLinkEvent::SessionOpened {
                session_id: session.id,
                device_id: device_id.to_string(),
                appointment_id: appointment_id.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
            EVENT_SOURCE,
        );
        Ok(session.id)
    }

    /// Power off, record usage, and run the compliance check.
    pub async fn turn_off_and_record(
        &self,
        device_id: &str,
        session_id: Uuid,
    ) -> SessionResult<UsageSession> {
        let mut session = self
            .usage
            .session(session_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or(ValidationError::UnknownSession(session_id))?;
        if session.status.is_terminal() {
            return Err(ValidationError::SessionClosed(session_id).into());
        }

        let handle = self
            .devices
            .device(device_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))?;

        // Read the meter before cutting power; fall back to the accrued
        // figure if the device does not answer
        let final_energy = match self.commands.status(&handle).await {
            Ok(status) => status.power.total.unwrap_or(session.energy_kwh),
            Err(e) => {
                tracing::warn!(device_id, error = %e, "final status read failed");
                session.energy_kwh
            }
        };

        self.commands.power(&handle, false).await?;

        let now = Utc::now();
        let actual_minutes = (now - session.started_at).num_minutes();
        session.ended_at = Some(now);
        session.active_minutes = actual_minutes as f64;
        session.energy_kwh = final_energy;
        session.status = SessionStatus::Completed;
        self.usage
            .update_session(&session)
            .await
            .map_err(SessionError::Store)?;

        if let Err(e) = self
            .commands
            .set_indicator(&handle, IndicatorMode::Default)
            .await
        {
            tracing::debug!(device_id, error = %e, "indicator restore failed");
        }

        tracing::info!(
            device_id,
            session_id = %session.id,
            minutes = actual_minutes,
            energy_kwh = final_energy,
            "usage session closed"
        );
        self.bus.publish_with_source(
            PlugLinkEvent::SessionClosed {
                session_id: session.id,
                device_id: device_id.to_string(),
                status: session.status.to_string(),
                timestamp: now.timestamp_millis(),
            },
            EVENT_SOURCE,
        );

        self.check_compliance(&session, actual_minutes).await;
        Ok(session)
    }

    /// Capture the previous meter total, then zero the counter.
    pub async fn reset_counter_for_service(&self, device_id: &str) -> SessionResult<Option<f64>> {
        let handle = self
            .devices
            .device(device_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))?;

        let previous = match self.commands.status(&handle).await {
            Ok(status) => status.power.total,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "pre-reset status read failed");
                None
            }
        };
        self.commands.reset_counters(&handle).await?;
        Ok(previous)
    }

    /// Overage beyond the estimate produces an audit record and an alert
    /// event. Never an error: billing disputes are handled by people.
    async fn check_compliance(&self, session: &UsageSession, actual_minutes: i64) {
        let overage = actual_minutes - session.estimated_minutes;
        if overage <= 0 {
            return;
        }

        let severity = if overage > usage::HIGH_SEVERITY_OVERAGE_MIN {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        };

        tracing::warn!(
            device_id = %session.device_id,
            session_id = %session.id,
            overage_minutes = overage,
            severity = %severity,
            "usage exceeded the appointment estimate"
        );

        let record = AuditRecord {
            id: Uuid::new_v4(),
            session_id: session.id,
            device_id: session.device_id.clone(),
            kind: "usage_overage".to_string(),
            severity,
            overage_minutes: overage,
            detail: format!(
                "actual {actual_minutes} min vs estimated {} min",
                session.estimated_minutes
            ),
            created_at: Utc::now(),
        };
        if let Err(e) = self.audit.append(&record).await {
            tracing::error!(session_id = %session.id, error = %e, "audit append failed");
        }

        self.bus.publish_with_source(
            PlugLinkEvent::ComplianceAlert {
                session_id: session.id,
                device_id: session.device_id.clone(),
                severity: severity.to_string(),
                overage_minutes: overage,
                timestamp: Utc::now().timestamp_millis(),
            },
            EVENT_SOURCE,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Appointment, AppointmentService, AppointmentStatus, ServiceStatus};
    use crate::store::{MemoryAuditLog, MemoryDeviceStore, MemoryUsageStore};
    use chrono::Duration;
    use pluglink_devices::{CommandError, Generation};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockCommands {
        calls: StdMutex<Vec<String>>,
        power_fails: StdMutex<bool>,
        meter_total: StdMutex<Option<f64>>,
    }

    #[async_trait]
    impl PlugCommands for MockCommands {
        async fn power(&self, handle: &DeviceHandle, on: bool) -> CommandResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("power:{}:{}", handle.device_id, on));
            if *self.power_fails.lock().unwrap() {
                return Err(CommandError::Cloud("unreachable".to_string()));
            }
            Ok(())
        }

        async fn status(&self, handle: &DeviceHandle) -> CommandResult<DeviceStatus> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("status:{}", handle.device_id));
            let mut status = DeviceStatus::online_now();
            status.power.total = *self.meter_total.lock().unwrap();
            Ok(status)
        }

        async fn reset_counters(&self, handle: &DeviceHandle) -> CommandResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reset:{}", handle.device_id));
            Ok(())
        }

        async fn set_indicator(
            &self,
            handle: &DeviceHandle,
            mode: IndicatorMode,
        ) -> CommandResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("indicator:{}:{:?}", handle.device_id, mode));
            Ok(())
        }
    }

    struct Fixture {
        service: DeviceControlService,
        commands: Arc<MockCommands>,
        usage: Arc<MemoryUsageStore>,
        audit: Arc<MemoryAuditLog>,
        bus: EventBus,
    }

    async fn fixture() -> Fixture {
        let commands = Arc::new(MockCommands::default());
        let devices = MemoryDeviceStore::new();
        devices
            .insert(DeviceHandle::new("plug-1", Generation::Gen3))
            .await;
        let usage = MemoryUsageStore::new();
        usage
            .insert_appointment(Appointment {
                id: "apt-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                status: AppointmentStatus::InProgress,
                services: vec![AppointmentService {
                    id: "svc-1".to_string(),
                    name: "laser".to_string(),
                    status: ServiceStatus::Scheduled,
                    estimated_minutes: 30,
                    auto_shutdown: true,
                }],
            })
            .await;
        let audit = MemoryAuditLog::new();
        let bus = EventBus::new();
        let service = DeviceControlService::new(
            commands.clone(),
            devices,
            usage.clone(),
            audit.clone(),
            bus.clone(),
        );
        Fixture {
            service,
            commands,
            usage,
            audit,
            bus,
        }
    }

    #[tokio::test]
    async fn test_turn_on_happy_path() {
        let f = fixture().await;
        let mut rx = f.bus.filter().session_events();

        let session_id = f
            .service
            .validate_and_turn_on("plug-1", "apt-1", "svc-1")
            .await
            .unwrap();

        let session = f.usage.session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.estimated_minutes, 30);
        assert!(session.auto_shutdown);

        // Counter reset, then power, then indicator
        let calls = f.commands.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["reset:plug-1", "power:plug-1:true", "indicator:plug-1:Session"]
        );

        let (event, _) = rx.try_recv().unwrap();
        assert_eq!(event.type_name(), "SessionOpened");
    }

    #[tokio::test]
    async fn test_turn_on_rejects_inactive_appointment() {
        let f = fixture().await;
        f.usage
            .insert_appointment(Appointment {
                id: "apt-2".to_string(),
                tenant_id: "tenant-1".to_string(),
                status: AppointmentStatus::Scheduled,
                services: vec![],
            })
            .await;

        let err = f
            .service
            .validate_and_turn_on("plug-1", "apt-2", "svc-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::AppointmentNotInProgress { .. })
        ));
        // Nothing was commanded
        assert!(f.commands.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_turn_on_rejects_completed_service() {
        let f = fixture().await;
        f.usage
            .insert_appointment(Appointment {
                id: "apt-3".to_string(),
                tenant_id: "tenant-1".to_string(),
                status: AppointmentStatus::InProgress,
                services: vec![AppointmentService {
                    id: "svc-done".to_string(),
                    name: "laser".to_string(),
                    status: ServiceStatus::Completed,
                    estimated_minutes: 30,
                    auto_shutdown: false,
                }],
            })
            .await;

        let err = f
            .service
            .validate_and_turn_on("plug-1", "apt-3", "svc-done")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::ServiceNotEligible { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_open_session_per_device() {
        let f = fixture().await;
        let first = f
            .service
            .validate_and_turn_on("plug-1", "apt-1", "svc-1")
            .await
            .unwrap();

        let err = f
            .service
            .validate_and_turn_on("plug-1", "apt-1", "svc-1")
            .await
            .unwrap_err();
        match err {
            SessionError::Validation(ValidationError::SessionAlreadyActive {
                session_id, ..
            }) => assert_eq!(session_id, first),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_power_failure_creates_no_session() {
        let f = fixture().await;
        *f.commands.power_fails.lock().unwrap() = true;

        let err = f
            .service
            .validate_and_turn_on("plug-1", "apt-1", "svc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Command(_)));
        assert!(f
            .usage
            .active_session_for_device("plug-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_turn_off_records_usage_and_energy() {
        let f = fixture().await;
        *f.commands.meter_total.lock().unwrap() = Some(0.75);
        let session_id = f
            .service
            .validate_and_turn_on("plug-1", "apt-1", "svc-1")
            .await
            .unwrap();

        // Backdate the session: 25 minutes of use, under the estimate
        let mut session = f.usage.session(session_id).await.unwrap().unwrap();
        session.started_at = Utc::now() - Duration::minutes(25);
        f.usage.update_session(&session).await.unwrap();

        let closed = f
            .service
            .turn_off_and_record("plug-1", session_id)
            .await
            .unwrap();
        assert_eq!(closed.status, SessionStatus::Completed);
        assert_eq!(closed.active_minutes, 25.0);
        assert_eq!(closed.energy_kwh, 0.75);
        assert!(closed.ended_at.is_some());

        // Under the estimate: no alert
        assert!(f.audit.records().await.is_empty());

        // Closing twice is a validation error
        let err = f
            .service
            .turn_off_and_record("plug-1", session_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_overage_severity_thresholds() {
        for (minutes_used, expected) in [(45i64, AlertSeverity::Medium), (75, AlertSeverity::High)]
        {
            let f = fixture().await;
            let mut rx = f.bus.filter().session_events();
            let session_id = f
                .service
                .validate_and_turn_on("plug-1", "apt-1", "svc-1")
                .await
                .unwrap();

            let mut session = f.usage.session(session_id).await.unwrap().unwrap();
            session.started_at = Utc::now() - Duration::minutes(minutes_used);
            f.usage.update_session(&session).await.unwrap();

            f.service
                .turn_off_and_record("plug-1", session_id)
                .await
                .unwrap();

            let records = f.audit.records().await;
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].severity, expected);
            assert_eq!(records[0].overage_minutes, minutes_used - 30);

            // SessionOpened, SessionClosed, then the alert
            let mut alert = None;
            while let Some((event, _)) = rx.try_recv() {
                if let PlugLinkEvent::ComplianceAlert { severity, .. } = event {
                    alert = Some(severity);
                }
            }
            assert_eq!(alert.as_deref(), Some(expected.to_string().as_str()));
        }
    }
}
