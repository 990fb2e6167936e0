//! Inbound frame routing.
//!
//! Accepted frames land on the bus tagged only with their connection id.
//! The router maps the frame back to a device via the envelope `src`,
//! hands it to that device's generation adapter, and feeds the normalized
//! status into the offline tracker. Frames from unregistered devices and
//! frames the adapter does not recognize are dropped.

use crate::protocol::{adapter_for, Generation};
use crate::tracker::OfflineTracker;
use pluglink_core::{EventBus, PlugLinkEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Routes inbound frames to per-device adapters and the tracker.
#[derive(Clone)]
pub struct StatusRouter {
    tracker: OfflineTracker,
    registry: Arc<RwLock<HashMap<String, Generation>>>,
}

impl StatusRouter {
    pub fn new(tracker: OfflineTracker) -> Self {
        Self {
            tracker,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a device so its frames can be decoded.
    pub async fn register(&self, device_id: impl Into<String>, generation: Generation) {
        self.registry
            .write()
            .await
            .insert(device_id.into(), generation);
    }

    pub async fn unregister(&self, device_id: &str) {
        self.registry.write().await.remove(device_id);
    }

    /// Decode one accepted frame and feed the tracker.
    pub async fn route(&self, connection_id: Uuid, frame: &Value) {
        let Some(device_id) = frame.get("src").and_then(Value::as_str) else {
            tracing::debug!(%connection_id, "frame without src, dropping");
            return;
        };

        let Some(generation) = self.registry.read().await.get(device_id).copied() else {
            tracing::debug!(device_id, "frame from unregistered device, dropping");
            return;
        };

        let Some(status) = adapter_for(generation).parse_notification(frame) else {
            // Command replies also arrive here; only notifications carry
            // status
            return;
        };

        self.tracker
            .observe_status(device_id, Some(connection_id), status)
            .await;
    }

    /// Bridge accepted frames from the bus into the router.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.filter().message_events();
        tokio::spawn(async move {
            while let Some((event, _)) = rx.recv().await {
                if let PlugLinkEvent::MessageReceived {
                    connection_id,
                    payload,
                    ..
                } = event
                {
                    self.route(connection_id, &payload).await;
                }
            }
        })
    }
}
