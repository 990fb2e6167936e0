//! Usage reconciliation.
//!
//! Every canonical status for a device with a live session feeds the
//! reconciler. Energy accrues trapezoidally between samples, active minutes
//! track measurable draw, and the session start re-bases to the first
//! sample with real draw so idle setup time is never billed. Offline gaps
//! pause the session; accrual never bridges a gap.

use crate::control::PlugCommands;
use crate::error::{SessionError, SessionResult};
use crate::model::{SessionStatus, UsageSession};
use crate::store::{DeviceStore, UsageStore};
use chrono::{DateTime, Utc};
use pluglink_core::config::usage;
use pluglink_core::{EventBus, PlugLinkEvent};
use pluglink_devices::DeviceStatus;
use std::sync::Arc;
use tokio::task::JoinHandle;

const EVENT_SOURCE: &str = "usage_reconciler";

/// Accrues usage against live sessions from inbound status samples.
#[derive(Clone)]
pub struct UsageReconciler {
    usage: Arc<dyn UsageStore>,
    devices: Arc<dyn DeviceStore>,
    commands: Arc<dyn PlugCommands>,
    bus: EventBus,
}

impl UsageReconciler {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        devices: Arc<dyn DeviceStore>,
        commands: Arc<dyn PlugCommands>,
        bus: EventBus,
    ) -> Self {
        Self {
            usage,
            devices,
            commands,
            bus,
        }
    }

    /// Bridge bus device events into the reconciler.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut rx = self.bus.filter().device_events();
        tokio::spawn(async move {
            while let Some((event, _)) = rx.recv().await {
                match event {
                    PlugLinkEvent::DeviceUpdate {
                        device_id, status, ..
                    } => {
                        let Ok(status) = serde_json::from_value::<DeviceStatus>(status) else {
                            continue;
                        };
                        if let Err(e) = self.observe(&device_id, &status).await {
                            tracing::warn!(device_id, error = %e, "reconciliation failed");
                        }
                    }
                    PlugLinkEvent::DeviceOffline { device_id, .. } => {
                        if let Err(e) = self.device_offline(&device_id).await {
                            tracing::warn!(device_id, error = %e, "pause on offline failed");
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    /// Reconcile one status sample against the device's live session.
    pub async fn observe(&self, device_id: &str, status: &DeviceStatus) -> SessionResult<()> {
        let Some(mut session) = self
            .usage
            .active_session_for_device(device_id)
            .await
            .map_err(SessionError::Store)?
        else {
            return Ok(());
        };

        let now = status.last_update;

        if !status.relay.is_on {
            // Someone or something cut the power outside our control:
            // close with what accrued
            self.close(&mut session, SessionStatus::Completed, now).await?;
            return Ok(());
        }

        if session.status == SessionStatus::Paused {
            // Fresh data after a gap: resume with a clean baseline so the
            // dark period accrues nothing
            session.status = SessionStatus::Active;
            session.last_sample_at = Some(now);
            session.last_sample_watts = status.power.current;
            tracing::info!(device_id, session_id = %session.id, "session resumed");
            self.usage
                .update_session(&session)
                .await
                .map_err(SessionError::Store)?;
            return Ok(());
        }

        if status.has_measurable_draw(usage::ACTIVE_POWER_THRESHOLD_W) {
            let watts = status.power.current.unwrap_or(0.0);
            let prev_measurable = session
                .last_sample_watts
                .map(|w| w > usage::ACTIVE_POWER_THRESHOLD_W)
                .unwrap_or(false);

            if !prev_measurable && session.active_minutes == 0.0 {
                // First sample with real draw anchors the session start
                session.started_at = now;
            } else if let Some(prev_at) = session.last_sample_at {
                let dt_minutes = (now - prev_at).num_milliseconds() as f64 / 60_000.0;
                if dt_minutes > 0.0 {
                    let prev_watts = session.last_sample_watts.unwrap_or(0.0);
                    session.energy_kwh += (prev_watts + watts) / 2.0 * (dt_minutes / 60.0) / 1000.0;
                    session.active_minutes += dt_minutes;
                }
            }
            session.last_sample_at = Some(now);
            session.last_sample_watts = Some(watts);

            if session.auto_shutdown && session.active_minutes >= session.estimated_minutes as f64 {
                self.auto_shutdown(&mut session, now).await?;
                return Ok(());
            }
        } else {
            // Standby: relay on, nothing drawing. Move the baseline so a
            // later draw does not accrue across the idle stretch
            session.last_sample_at = Some(now);
            session.last_sample_watts = status.power.current.or(Some(0.0));
        }

        self.usage
            .update_session(&session)
            .await
            .map_err(SessionError::Store)
    }

    /// Pause the device's live session, if any. Idempotent.
    pub async fn device_offline(&self, device_id: &str) -> SessionResult<()> {
        let Some(mut session) = self
            .usage
            .active_session_for_device(device_id)
            .await
            .map_err(SessionError::Store)?
        else {
            return Ok(());
        };
        if session.status != SessionStatus::Active {
            return Ok(());
        }

        session.status = SessionStatus::Paused;
        session.last_sample_at = None;
        session.last_sample_watts = None;
        tracing::warn!(device_id, session_id = %session.id, "session paused: device offline");
        self.usage
            .update_session(&session)
            .await
            .map_err(SessionError::Store)
    }

    async fn auto_shutdown(
        &self,
        session: &mut UsageSession,
        now: DateTime<Utc>,
    ) -> SessionResult<()> {
        // Issue the power-off and log the outcome either way; the session
        // closes regardless so the estimate is never overrun silently
        match self
            .devices
            .device(&session.device_id)
            .await
            .map_err(SessionError::Store)?
        {
            Some(handle) => match self.commands.power(&handle, false).await {
                Ok(()) => tracing::info!(
                    device_id = %session.device_id,
                    session_id = %session.id,
                    "auto-shutdown power-off issued"
                ),
                Err(e) => tracing::error!(
                    device_id = %session.device_id,
                    session_id = %session.id,
                    error = %e,
                    "auto-shutdown power-off failed"
                ),
            },
            None => tracing::error!(
                device_id = %session.device_id,
                "auto-shutdown: device record missing"
            ),
        }

        self.close(session, SessionStatus::AutoShutdown, now).await
    }

    async fn close(
        &self,
        session: &mut UsageSession,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> SessionResult<()> {
        session.status = status;
        session.ended_at = Some(now);
        self.usage
            .update_session(session)
            .await
            .map_err(SessionError::Store)?;

        tracing::info!(
            device_id = %session.device_id,
            session_id = %session.id,
            status = %status,
            active_minutes = session.active_minutes,
            energy_kwh = session.energy_kwh,
            "session closed by reconciler"
        );
        self.bus.publish_with_source(
            PlugLinkEvent::SessionClosed {
                session_id: session.id,
                device_id: session.device_id.clone(),
                status: status.to_string(),
                timestamp: now.timestamp_millis(),
            },
            EVENT_SOURCE,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDeviceStore, MemoryUsageStore};
    use async_trait::async_trait;
    use chrono::Duration;
    use pluglink_devices::{
        CommandResult, DeviceHandle, Generation, IndicatorMode,
    };
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockCommands {
        power_calls: StdMutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl PlugCommands for MockCommands {
        async fn power(&self, handle: &DeviceHandle, on: bool) -> CommandResult<()> {
            self.power_calls
                .lock()
                .unwrap()
                .push((handle.device_id.clone(), on));
            Ok(())
        }

        async fn status(&self, _handle: &DeviceHandle) -> CommandResult<DeviceStatus> {
            Ok(DeviceStatus::online_now())
        }

        async fn reset_counters(&self, _handle: &DeviceHandle) -> CommandResult<()> {
            Ok(())
        }

        async fn set_indicator(
            &self,
            _handle: &DeviceHandle,
            _mode: IndicatorMode,
        ) -> CommandResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        reconciler: UsageReconciler,
        usage: Arc<MemoryUsageStore>,
        commands: Arc<MockCommands>,
        bus: EventBus,
        session_id: uuid::Uuid,
        t0: DateTime<Utc>,
    }

    async fn fixture(estimated_minutes: i64, auto_shutdown: bool) -> Fixture {
        let usage = MemoryUsageStore::new();
        let devices = MemoryDeviceStore::new();
        devices
            .insert(DeviceHandle::new("plug-1", Generation::Gen2))
            .await;
        let commands = Arc::new(MockCommands::default());
        let bus = EventBus::new();
        let reconciler = UsageReconciler::new(
            usage.clone(),
            devices,
            commands.clone(),
            bus.clone(),
        );

        let t0 = Utc::now();
        let mut session = UsageSession::open("apt-1", "svc-1", "plug-1", estimated_minutes, auto_shutdown);
        session.started_at = t0 - Duration::minutes(5);
        usage.create_session(&session).await.unwrap();

        Fixture {
            reconciler,
            usage,
            commands,
            bus,
            session_id: session.id,
            t0,
        }
    }

    fn sample(on: bool, watts: Option<f64>, at: DateTime<Utc>) -> DeviceStatus {
        let mut status = DeviceStatus::online_now();
        status.relay.is_on = on;
        status.power.current = watts;
        status.last_update = at;
        status
    }

    #[tokio::test]
    async fn test_trapezoidal_accrual_and_rebase() {
        let f = fixture(60, false).await;

        // First measurable draw anchors the session start
        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), f.t0))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.started_at, f.t0);
        assert_eq!(session.active_minutes, 0.0);
        assert_eq!(session.energy_kwh, 0.0);

        // Six minutes later at 200 W: trapezoid (100+200)/2 * 0.1 h
        let t1 = f.t0 + Duration::minutes(6);
        f.reconciler
            .observe("plug-1", &sample(true, Some(200.0), t1))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.active_minutes, 6.0);
        assert!((session.energy_kwh - 0.015).abs() < 1e-9);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_standby_never_accrues() {
        let f = fixture(60, false).await;
        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), f.t0))
            .await
            .unwrap();

        // Ten standby minutes: the baseline moves, nothing accrues
        let t1 = f.t0 + Duration::minutes(10);
        f.reconciler
            .observe("plug-1", &sample(true, Some(0.4), t1))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.energy_kwh, 0.0);
        assert_eq!(session.active_minutes, 0.0);
        assert_eq!(session.last_sample_at, Some(t1));

        // Draw returns before anything ever accrued: the start re-anchors
        // so the idle stretch is never billed
        let t2 = t1 + Duration::minutes(3);
        f.reconciler
            .observe("plug-1", &sample(true, Some(150.0), t2))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.started_at, t2);
        assert_eq!(session.energy_kwh, 0.0);
        assert_eq!(session.active_minutes, 0.0);

        let t3 = t2 + Duration::minutes(4);
        f.reconciler
            .observe("plug-1", &sample(true, Some(150.0), t3))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert!((session.energy_kwh - 150.0 * (4.0 / 60.0) / 1000.0).abs() < 1e-9);
        assert_eq!(session.active_minutes, 4.0);
    }

    #[tokio::test]
    async fn test_external_power_off_closes_session() {
        let f = fixture(60, false).await;
        let mut rx = f.bus.filter().session_events();

        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), f.t0))
            .await
            .unwrap();
        let t1 = f.t0 + Duration::minutes(4);
        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), t1))
            .await
            .unwrap();

        let t2 = t1 + Duration::minutes(1);
        f.reconciler
            .observe("plug-1", &sample(false, None, t2))
            .await
            .unwrap();

        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.ended_at, Some(t2));
        assert_eq!(session.active_minutes, 4.0);

        let (event, _) = rx.try_recv().unwrap();
        match event {
            PlugLinkEvent::SessionClosed { status, .. } => assert_eq!(status, "completed"),
            other => panic!("unexpected event {}", other.type_name()),
        }

        // Further samples for the device are ignored
        f.reconciler
            .observe("plug-1", &sample(true, Some(50.0), t2 + Duration::minutes(1)))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_offline_pauses_and_resume_resets_baseline() {
        let f = fixture(60, false).await;

        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), f.t0))
            .await
            .unwrap();
        let t1 = f.t0 + Duration::minutes(2);
        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), t1))
            .await
            .unwrap();

        f.reconciler.device_offline("plug-1").await.unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.last_sample_at, None);

        // Pausing twice changes nothing
        f.reconciler.device_offline("plug-1").await.unwrap();

        // Resume 30 minutes later: the gap accrues nothing
        let t2 = t1 + Duration::minutes(30);
        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), t2))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.active_minutes, 2.0);

        // Accrual continues from the resume baseline
        let t3 = t2 + Duration::minutes(5);
        f.reconciler
            .observe("plug-1", &sample(true, Some(100.0), t3))
            .await
            .unwrap();
        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.active_minutes, 7.0);
    }

    #[tokio::test]
    async fn test_auto_shutdown_at_estimate() {
        let f = fixture(10, true).await;
        let mut rx = f.bus.filter().session_events();

        f.reconciler
            .observe("plug-1", &sample(true, Some(500.0), f.t0))
            .await
            .unwrap();
        let t1 = f.t0 + Duration::minutes(10);
        f.reconciler
            .observe("plug-1", &sample(true, Some(500.0), t1))
            .await
            .unwrap();

        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::AutoShutdown);
        assert_eq!(session.active_minutes, 10.0);
        assert_eq!(
            f.commands.power_calls.lock().unwrap().clone(),
            vec![("plug-1".to_string(), false)]
        );

        let (event, _) = rx.try_recv().unwrap();
        match event {
            PlugLinkEvent::SessionClosed { status, .. } => assert_eq!(status, "auto_shutdown"),
            other => panic!("unexpected event {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_device_without_opt_in_never_auto_shuts() {
        let f = fixture(10, false).await;

        f.reconciler
            .observe("plug-1", &sample(true, Some(500.0), f.t0))
            .await
            .unwrap();
        let t1 = f.t0 + Duration::minutes(30);
        f.reconciler
            .observe("plug-1", &sample(true, Some(500.0), t1))
            .await
            .unwrap();

        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.active_minutes, 30.0);
        assert!(f.commands.power_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bus_driven_reconciliation() {
        let f = fixture(60, false).await;
        let task = f.reconciler.clone().spawn();

        let status = sample(true, Some(100.0), f.t0);
        f.bus.publish_with_source(
            PlugLinkEvent::DeviceUpdate {
                device_id: "plug-1".to_string(),
                status: serde_json::to_value(&status).unwrap(),
                timestamp: f.t0.timestamp_millis(),
            },
            "offline_tracker",
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let session = f.usage.session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.started_at, f.t0);
        assert_eq!(session.last_sample_watts, Some(100.0));
        task.abort();
    }
}
