//! Tenant-scoped status fan-out.
//!
//! Device events on the bus carry device ids only; UI subscribers are
//! tenant-scoped. The gateway resolves each device to its tenant and
//! re-broadcasts on a per-tenant channel, so one tenant's browser never
//! sees another tenant's plugs.

use pluglink_core::{EventBus, PlugLinkEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

/// Event shape delivered to UI subscribers. The wire tags are the ones the
/// UI already listens for.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type")]
pub enum UiEvent {
    #[serde(rename = "device-update")]
    DeviceUpdate {
        device_id: String,
        status: serde_json::Value,
    },
    #[serde(rename = "device-offline-status")]
    DeviceOfflineStatus {
        device_id: String,
        online: bool,
        reason: Option<String>,
    },
}

/// Maps a device to its owning tenant.
#[async_trait::async_trait]
pub trait TenantResolver: Send + Sync {
    async fn tenant_of(&self, device_id: &str) -> Option<String>;
}

/// Static device-to-tenant table.
#[derive(Default)]
pub struct StaticTenantResolver {
    map: HashMap<String, String>,
}

impl StaticTenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, device_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        self.map.insert(device_id.into(), tenant_id.into());
        self
    }
}

#[async_trait::async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn tenant_of(&self, device_id: &str) -> Option<String> {
        self.map.get(device_id).cloned()
    }
}

/// Per-tenant broadcast of device status events.
#[derive(Clone)]
pub struct BroadcastGateway {
    resolver: Arc<dyn TenantResolver>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<UiEvent>>>>,
}

impl BroadcastGateway {
    pub fn new(resolver: Arc<dyn TenantResolver>) -> Self {
        Self {
            resolver,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to one tenant's stream. The channel is created on first
    /// subscribe and dropped again once the last receiver goes away.
    pub async fn subscribe(&self, tenant_id: &str) -> broadcast::Receiver<UiEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(tenant_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of live tenant channels, after pruning.
    pub async fn tenant_count(&self) -> usize {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels.len()
    }

    /// Route one UI event to its device's tenant. Events for devices with
    /// no tenant mapping are dropped.
    pub async fn deliver(&self, device_id: &str, event: UiEvent) {
        let Some(tenant_id) = self.resolver.tenant_of(device_id).await else {
            tracing::debug!(device_id, "no tenant mapping, dropping event");
            return;
        };

        let mut channels = self.channels.lock().await;
        let Some(tx) = channels.get(&tenant_id) else {
            return;
        };
        if tx.send(event).is_err() {
            // Last receiver is gone
            channels.remove(&tenant_id);
        }
    }

    /// Bridge bus device events into tenant channels.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.filter().device_events();
        tokio::spawn(async move {
            while let Some((event, _)) = rx.recv().await {
                match event {
                    PlugLinkEvent::DeviceUpdate {
                        device_id, status, ..
                    } => {
                        let id = device_id.clone();
                        self.deliver(&id, UiEvent::DeviceUpdate { device_id, status })
                            .await;
                    }
                    PlugLinkEvent::DeviceOnline { device_id, .. } => {
                        let id = device_id.clone();
                        self.deliver(
                            &id,
                            UiEvent::DeviceOfflineStatus {
                                device_id,
                                online: true,
                                reason: None,
                            },
                        )
                        .await;
                    }
                    PlugLinkEvent::DeviceOffline {
                        device_id, reason, ..
                    } => {
                        let id = device_id.clone();
                        self.deliver(
                            &id,
                            UiEvent::DeviceOfflineStatus {
                                device_id,
                                online: false,
                                reason,
                            },
                        )
                        .await;
                    }
                    _ => {}
                }
            }
        })
    }
}
