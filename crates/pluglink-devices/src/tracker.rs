//! Dual-level device liveness tracking.
//!
//! Two independent signals per device:
//!
//! - **Consumption freshness**: a power reading older than 12s is cleared to
//!   "no data" so the UI never shows a stale wattage. The device stays
//!   online.
//! - **Connectivity liveness**: a device silent for 180s is marked offline,
//!   exactly once.
//!
//! Subscribers are notified before any durable write; the storage
//! collaborator always runs after the bus publish. A periodic sweep task
//! evaluates staleness even when no traffic arrives; construction via
//! [`OfflineTracker::piggyback_only`] skips the sweep and relies on inbound
//! traffic alone, which only suits fleets with steady chatter.

use crate::status::DeviceStatus;
use async_trait::async_trait;
use pluglink_core::config::liveness;
use pluglink_core::{EventBus, PlugLinkEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const EVENT_SOURCE: &str = "offline_tracker";

/// Durable-write collaborator for status snapshots.
///
/// Called strictly after subscribers have been notified.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn persist_status(&self, device_id: &str, status: &DeviceStatus) -> anyhow::Result<()>;
}

/// Sink that discards snapshots, for wiring without persistence.
pub struct NullSink;

#[async_trait]
impl StatusSink for NullSink {
    async fn persist_status(&self, _device_id: &str, _status: &DeviceStatus) -> anyhow::Result<()> {
        Ok(())
    }
}

struct DeviceLiveness {
    connection_id: Option<Uuid>,
    online: bool,
    last_seen: Instant,
    last_consumption: Option<Instant>,
    status: DeviceStatus,
}

struct StaleOutcome {
    device_id: String,
    event: PlugLinkEvent,
    status: DeviceStatus,
}

/// Tracks liveness for every known device.
#[derive(Clone)]
pub struct OfflineTracker {
    inner: Arc<Mutex<HashMap<String, DeviceLiveness>>>,
    bus: EventBus,
    sink: Arc<dyn StatusSink>,
    tasks: Arc<Vec<JoinHandle<()>>>,
}

impl OfflineTracker {
    /// Tracker with the periodic staleness sweep (the default policy).
    pub fn new(bus: EventBus, sink: Arc<dyn StatusSink>) -> Self {
        let tracker = Self::piggyback_only(bus, sink);

        let sweep = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(liveness::SWEEP_INTERVAL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    tracker.evaluate_now().await;
                }
            })
        };
        let listener = {
            let tracker = tracker.clone();
            let mut rx = tracker.bus.filter().connection_events();
            tokio::spawn(async move {
                while let Some((event, _)) = rx.recv().await {
                    if let PlugLinkEvent::ConnectionClosed { connection_id, .. }
                    | PlugLinkEvent::ConnectionFailed { connection_id, .. } = event
                    {
                        tracker.connection_lost(connection_id).await;
                    }
                }
            })
        };

        Self {
            tasks: Arc::new(vec![sweep, listener]),
            ..tracker
        }
    }

    /// Tracker without the sweep task: staleness is evaluated only when
    /// some device's traffic arrives. A silent fleet never goes offline
    /// under this policy.
    pub fn piggyback_only(bus: EventBus, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            bus,
            sink,
            tasks: Arc::new(Vec::new()),
        }
    }

    /// Feed one inbound status. Refreshes both timers, re-evaluates every
    /// device, then always emits the fresh update.
    pub async fn observe_status(
        &self,
        device_id: &str,
        connection_id: Option<Uuid>,
        status: DeviceStatus,
    ) {
        let now = Instant::now();
        let (came_online, stored, stale) = {
            let mut devices = self.inner.lock().await;
            let entry = devices
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceLiveness {
                    connection_id,
                    online: false,
                    last_seen: now,
                    last_consumption: None,
                    status: DeviceStatus::default(),
                });

            let came_online = !entry.online;
            entry.online = true;
            if connection_id.is_some() {
                entry.connection_id = connection_id;
            }
            entry.last_seen = now;
            if status.power.current.is_some() {
                entry.last_consumption = Some(now);
            }
            let mut stored = status;
            stored.online = true;
            entry.status = stored.clone();

            let stale = Self::evaluate_locked(&mut devices, now);
            (came_online, stored, stale)
        };

        // Notify first, persist after: subscribers must never wait on the
        // store.
        for outcome in &stale {
            self.bus.publish_with_source(outcome.event.clone(), EVENT_SOURCE);
        }
        if came_online {
            self.bus.publish_with_source(
                PlugLinkEvent::DeviceOnline {
                    device_id: device_id.to_string(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
                EVENT_SOURCE,
            );
        }
        self.bus.publish_with_source(
            PlugLinkEvent::DeviceUpdate {
                device_id: device_id.to_string(),
                status: serde_json::to_value(&stored).unwrap_or_default(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            EVENT_SOURCE,
        );

        self.persist(device_id, &stored).await;
        for outcome in &stale {
            self.persist(&outcome.device_id, &outcome.status).await;
        }
    }

    /// Evaluate staleness across all devices and publish what changed.
    /// The sweep task calls this on its tick.
    pub async fn evaluate_now(&self) {
        let stale = {
            let mut devices = self.inner.lock().await;
            Self::evaluate_locked(&mut devices, Instant::now())
        };
        for outcome in &stale {
            self.bus.publish_with_source(outcome.event.clone(), EVENT_SOURCE);
        }
        for outcome in &stale {
            self.persist(&outcome.device_id, &outcome.status).await;
        }
    }

    /// Mark every device on a lost connection offline immediately.
    pub async fn connection_lost(&self, connection_id: Uuid) {
        let affected = {
            let mut devices = self.inner.lock().await;
            let mut affected = Vec::new();
            for (device_id, entry) in devices.iter_mut() {
                if entry.connection_id != Some(connection_id) || !entry.online {
                    continue;
                }
                entry.online = false;
                entry.status.online = false;
                entry.status.power.current = None;
                entry.last_consumption = None;
                affected.push((device_id.clone(), entry.status.clone()));
            }
            affected
        };

        for (device_id, _) in &affected {
            tracing::warn!(device_id = %device_id, connection_id = %connection_id, "device offline: connection lost");
            self.bus.publish_with_source(
                PlugLinkEvent::DeviceOffline {
                    device_id: device_id.clone(),
                    reason: Some("connection_lost".to_string()),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
                EVENT_SOURCE,
            );
        }
        for (device_id, status) in &affected {
            self.persist(device_id, status).await;
        }
    }

    fn evaluate_locked(
        devices: &mut HashMap<String, DeviceLiveness>,
        now: Instant,
    ) -> Vec<StaleOutcome> {
        let mut outcomes = Vec::new();
        for (device_id, entry) in devices.iter_mut() {
            if entry.online && now.duration_since(entry.last_seen) > liveness::STATE_TIMEOUT {
                // Flips exactly once: the guard above never matches an
                // already-offline device
                entry.online = false;
                entry.status.online = false;
                entry.status.power.current = None;
                entry.last_consumption = None;
                outcomes.push(StaleOutcome {
                    device_id: device_id.clone(),
                    event: PlugLinkEvent::DeviceOffline {
                        device_id: device_id.clone(),
                        reason: Some("state_timeout".to_string()),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    },
                    status: entry.status.clone(),
                });
                continue;
            }

            let consumption_stale = entry
                .last_consumption
                .map(|at| now.duration_since(at) > liveness::CONSUMPTION_TIMEOUT)
                .unwrap_or(false);
            if consumption_stale && entry.status.power.current.is_some() {
                let last_watts = entry.status.power.current.take();
                entry.last_consumption = None;
                outcomes.push(StaleOutcome {
                    device_id: device_id.clone(),
                    event: PlugLinkEvent::ConsumptionCleared {
                        device_id: device_id.clone(),
                        last_watts,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    },
                    status: entry.status.clone(),
                });
            }
        }
        outcomes
    }

    async fn persist(&self, device_id: &str, status: &DeviceStatus) {
        if let Err(e) = self.sink.persist_status(device_id, status).await {
            tracing::warn!(device_id = %device_id, error = %e, "status persist failed");
        }
    }

    /// Latest known status for a device.
    pub async fn status_of(&self, device_id: &str) -> Option<DeviceStatus> {
        self.inner
            .lock()
            .await
            .get(device_id)
            .map(|e| e.status.clone())
    }

    /// Whether a device is currently considered online.
    pub async fn is_online(&self, device_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(device_id)
            .map(|e| e.online)
            .unwrap_or(false)
    }

    /// Number of tracked devices.
    pub async fn device_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Stop the sweep and listener tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.iter() {
            task.abort();
        }
    }
}
