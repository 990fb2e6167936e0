//! Persistent connection manager.
//!
//! Owns every outbound cloud connection: opening links through the
//! [`Transport`], reconnecting with exponential backoff, queueing outbound
//! messages by priority, and draining the queue on a fixed tick. All
//! lifecycle changes are published on the event bus; nothing polls the
//! manager for state.

use crate::config::ConnectionConfig;
use crate::error::{ConnectError, ConnectResult};
use crate::transport::{Transport, TransportLink};
use futures::future::BoxFuture;
use pluglink_core::config::connection as timing;
use pluglink_core::{
    EventBus, MessageEnvelope, MessagePriority, PlugLinkEvent, PriorityMessageQueue,
    TokenBucketRateLimiter,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_SOURCE: &str = "connection_manager";

/// Lifecycle states of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    /// A connect attempt is in flight.
    Connecting,
    /// The link is open and draining.
    Connected,
    /// A deliberate close is in progress.
    Disconnecting,
    /// Closed on purpose; no reconnect will happen.
    Disconnected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Reconnect budget exhausted; only an explicit reconnect revives it.
    Failed,
    /// Paused by the caller; the link is closed but state is retained.
    Suspended,
}

impl ConnectionStatus {
    /// Whether the lifecycle graph allows moving to `next` from here.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnecting)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Connected, Disconnecting)
                | (Connected, Suspended)
                | (Connected, Failed)
                | (Reconnecting, Connecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Suspended, Connecting)
                | (Suspended, Disconnecting)
                | (Failed, Connecting)
                | (Failed, Disconnecting)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Public snapshot of a managed connection.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: Uuid,
    pub url: String,
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Aggregate counters for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetrics {
    pub total: usize,
    pub connected: usize,
    pub reconnecting: usize,
    pub failed: usize,
    pub queued: usize,
}

struct Entry {
    record: Connection,
    config: ConnectionConfig,
    outbound: Option<mpsc::Sender<(Uuid, String)>>,
    io_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Entry {
    /// Move to `next` if the lifecycle graph allows it.
    fn transition(&mut self, next: ConnectionStatus) -> bool {
        if self.record.status == next {
            return true;
        }
        if self.record.status.can_transition_to(next) {
            tracing::debug!(
                connection_id = %self.record.id,
                from = %self.record.status,
                to = %next,
                "connection state change"
            );
            self.record.status = next;
            true
        } else {
            tracing::warn!(
                connection_id = %self.record.id,
                from = %self.record.status,
                to = %next,
                "rejected invalid connection state change"
            );
            false
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        self.outbound = None;
    }
}

struct Inner {
    connections: RwLock<HashMap<Uuid, Entry>>,
    queue: PriorityMessageQueue,
    limiter: TokenBucketRateLimiter,
    bus: EventBus,
    transport: Arc<dyn Transport>,
}

/// Manages persistent cloud connections for a process.
///
/// Cheap to clone; all clones share the same connection table, queue, and
/// drain loop.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
    drain_task: Arc<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager draining through `transport`, publishing on `bus`.
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus) -> Self {
        let inner = Arc::new(Inner {
            connections: RwLock::new(HashMap::new()),
            queue: PriorityMessageQueue::new(),
            limiter: TokenBucketRateLimiter::new(),
            bus,
            transport,
        });

        let drain_inner = inner.clone();
        let drain_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(timing::DRAIN_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                Inner::drain_once(&drain_inner).await;
            }
        });

        Self {
            inner,
            drain_task: Arc::new(drain_task),
        }
    }

    /// Register a connection and start the first connect attempt.
    ///
    /// Always returns the new id; an initial failure moves the connection
    /// into the reconnect cycle rather than surfacing an error.
    pub async fn connect(&self, config: ConnectionConfig) -> Uuid {
        let id = Uuid::new_v4();

        if let Some(limit) = config.rate_limit {
            self.inner
                .limiter
                .configure(id, limit.capacity, limit.per_second)
                .await;
        }

        let record = Connection {
            id,
            url: config.url.to_string(),
            status: ConnectionStatus::Connecting,
            reconnect_attempts: 0,
            tags: config.tags.clone(),
            metadata: config.metadata.clone(),
            created_at: chrono::Utc::now(),
        };

        self.inner.connections.write().await.insert(
            id,
            Entry {
                record,
                config,
                outbound: None,
                io_task: None,
                reconnect_task: None,
            },
        );

        Inner::try_open(&self.inner, id).await;
        id
    }

    /// Queue a payload for delivery on a connection.
    ///
    /// The envelope rides the priority queue and goes out on a drain tick,
    /// so delivery is asynchronous. Returns the envelope id.
    pub async fn send(
        &self,
        connection_id: Uuid,
        payload: serde_json::Value,
        priority: MessagePriority,
    ) -> ConnectResult<Uuid> {
        let queue_capacity = {
            let connections = self.inner.connections.read().await;
            let entry = connections
                .get(&connection_id)
                .ok_or(ConnectError::NotFound(connection_id))?;
            if entry.record.status == ConnectionStatus::Failed {
                return Err(ConnectError::InvalidState {
                    id: connection_id,
                    status: entry.record.status.to_string(),
                    operation: "send",
                });
            }
            entry.config.queue_capacity
        };

        if self.inner.queue.pending_for(connection_id).await >= queue_capacity {
            return Err(ConnectError::QueueFull(connection_id));
        }

        let envelope = MessageEnvelope::new(connection_id, payload, priority);
        let envelope_id = envelope.id;
        self.inner
            .queue
            .enqueue(envelope)
            .await
            .map_err(|_| ConnectError::QueueFull(connection_id))?;
        Ok(envelope_id)
    }

    /// Queue a payload on every connection whose tags intersect `tags`.
    ///
    /// An empty tag list targets all connections. Returns the envelope ids
    /// that were queued.
    pub async fn broadcast(&self, payload: serde_json::Value, tags: &[String]) -> Vec<Uuid> {
        let targets: Vec<Uuid> = {
            let connections = self.inner.connections.read().await;
            connections
                .values()
                .filter(|e| e.record.status != ConnectionStatus::Failed)
                .filter(|e| tags.is_empty() || e.record.tags.iter().any(|t| tags.contains(t)))
                .map(|e| e.record.id)
                .collect()
        };

        let mut envelope_ids = Vec::with_capacity(targets.len());
        for id in targets {
            match self
                .send(id, payload.clone(), MessagePriority::Normal)
                .await
            {
                Ok(envelope_id) => envelope_ids.push(envelope_id),
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "broadcast enqueue failed")
                }
            }
        }
        envelope_ids
    }

    /// Close a connection on purpose and forget it.
    ///
    /// Cancels any reconnect in flight, drops the connection's queued
    /// envelopes, and releases its rate-limit bucket.
    pub async fn disconnect(&self, connection_id: Uuid) -> ConnectResult<()> {
        let mut entry = {
            let mut connections = self.inner.connections.write().await;
            connections
                .remove(&connection_id)
                .ok_or(ConnectError::NotFound(connection_id))?
        };
        entry.abort_tasks();

        let dropped = self.inner.queue.remove_connection(connection_id).await;
        self.inner.limiter.remove(connection_id).await;

        tracing::info!(
            connection_id = %connection_id,
            dropped_envelopes = dropped,
            "connection disconnected"
        );
        self.inner.bus.publish_with_source(
            PlugLinkEvent::ConnectionClosed {
                connection_id,
                reason: Some("disconnected".to_string()),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            EVENT_SOURCE,
        );
        Ok(())
    }

    /// Revive a `Failed` or `Suspended` connection with a fresh attempt
    /// budget.
    pub async fn reconnect(&self, connection_id: Uuid) -> ConnectResult<()> {
        {
            let mut connections = self.inner.connections.write().await;
            let entry = connections
                .get_mut(&connection_id)
                .ok_or(ConnectError::NotFound(connection_id))?;
            if !matches!(
                entry.record.status,
                ConnectionStatus::Failed | ConnectionStatus::Suspended
            ) {
                return Err(ConnectError::InvalidState {
                    id: connection_id,
                    status: entry.record.status.to_string(),
                    operation: "reconnect",
                });
            }
            entry.abort_tasks();
            entry.record.reconnect_attempts = 0;
            entry.transition(ConnectionStatus::Connecting);
        }
        Inner::try_open(&self.inner, connection_id).await;
        Ok(())
    }

    /// Pause a connected connection without forgetting it.
    pub async fn suspend(&self, connection_id: Uuid) -> ConnectResult<()> {
        let mut connections = self.inner.connections.write().await;
        let entry = connections
            .get_mut(&connection_id)
            .ok_or(ConnectError::NotFound(connection_id))?;
        if entry.record.status != ConnectionStatus::Connected {
            return Err(ConnectError::InvalidState {
                id: connection_id,
                status: entry.record.status.to_string(),
                operation: "suspend",
            });
        }
        entry.abort_tasks();
        entry.transition(ConnectionStatus::Suspended);
        Ok(())
    }

    /// Snapshot of one connection.
    pub async fn connection(&self, connection_id: Uuid) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .await
            .get(&connection_id)
            .map(|e| e.record.clone())
    }

    /// Current status of one connection.
    pub async fn status(&self, connection_id: Uuid) -> Option<ConnectionStatus> {
        self.inner
            .connections
            .read()
            .await
            .get(&connection_id)
            .map(|e| e.record.status)
    }

    /// Snapshots of every connection.
    pub async fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .read()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    /// Aggregate counters.
    pub async fn metrics(&self) -> ManagerMetrics {
        let connections = self.inner.connections.read().await;
        let mut metrics = ManagerMetrics {
            total: connections.len(),
            connected: 0,
            reconnecting: 0,
            failed: 0,
            queued: self.inner.queue.len().await,
        };
        for entry in connections.values() {
            match entry.record.status {
                ConnectionStatus::Connected => metrics.connected += 1,
                ConnectionStatus::Reconnecting => metrics.reconnecting += 1,
                ConnectionStatus::Failed => metrics.failed += 1,
                _ => {}
            }
        }
        metrics
    }

    /// Stop the drain loop and tear down every connection.
    pub async fn shutdown(&self) {
        self.drain_task.abort();
        let mut connections = self.inner.connections.write().await;
        for (_, mut entry) in connections.drain() {
            entry.abort_tasks();
        }
        self.inner.queue.clear().await;
        tracing::info!("connection manager shut down");
    }
}

impl Inner {
    /// One connect attempt, bounded by the connect timeout.
    ///
    /// Boxed because the reconnect path re-enters this function, making the
    /// async fn recursive.
    fn try_open(inner: &Arc<Inner>, connection_id: Uuid) -> BoxFuture<'_, ()> {
        Box::pin(Self::try_open_inner(inner, connection_id))
    }

    async fn try_open_inner(inner: &Arc<Inner>, connection_id: Uuid) {
        let url = {
            let mut connections = inner.connections.write().await;
            let Some(entry) = connections.get_mut(&connection_id) else {
                return;
            };
            entry.transition(ConnectionStatus::Connecting);
            entry.config.url.clone()
        };

        match tokio::time::timeout(timing::CONNECT_TIMEOUT, inner.transport.open(&url)).await {
            Ok(Ok(link)) => Inner::on_open(inner, connection_id, link).await,
            Ok(Err(e)) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "connect failed");
                Inner::schedule_reconnect(inner, connection_id).await;
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    timeout = ?timing::CONNECT_TIMEOUT,
                    "connect timed out"
                );
                Inner::schedule_reconnect(inner, connection_id).await;
            }
        }
    }

    /// Wire up a freshly opened link and start its io task.
    async fn on_open(inner: &Arc<Inner>, connection_id: Uuid, link: Box<dyn TransportLink>) {
        let (tx, rx) = mpsc::channel(64);
        let url = {
            let mut connections = inner.connections.write().await;
            let Some(entry) = connections.get_mut(&connection_id) else {
                return;
            };
            if !entry.transition(ConnectionStatus::Connected) {
                return;
            }
            entry.record.reconnect_attempts = 0;
            entry.outbound = Some(tx);
            entry.reconnect_task = None;
            entry.io_task = Some(tokio::spawn(Inner::io_loop(
                inner.clone(),
                connection_id,
                link,
                rx,
                entry.config.ping_interval,
            )));
            entry.record.url.clone()
        };
        tracing::info!(connection_id = %connection_id, url = %url, "connection opened");
        inner.bus.publish_with_source(
            PlugLinkEvent::ConnectionOpened {
                connection_id,
                url,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            EVENT_SOURCE,
        );
    }

    /// Owns the link: writes outbound frames, reads inbound frames, sends
    /// keepalive pings. Exits when the link breaks or the entry is torn
    /// down.
    async fn io_loop(
        inner: Arc<Inner>,
        connection_id: Uuid,
        mut link: Box<dyn TransportLink>,
        mut outbound: mpsc::Receiver<(Uuid, String)>,
        ping_interval: std::time::Duration,
    ) {
        let start = tokio::time::Instant::now() + ping_interval;
        let mut ping = tokio::time::interval_at(start, ping_interval);

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some((envelope_id, text)) = frame else { break };
                    match link.send(text).await {
                        Ok(()) => {
                            inner.bus.publish_with_source(
                                PlugLinkEvent::MessageSent {
                                    connection_id,
                                    envelope_id,
                                    timestamp: chrono::Utc::now().timestamp_millis(),
                                },
                                EVENT_SOURCE,
                            );
                        }
                        Err(e) => {
                            inner.bus.publish_with_source(
                                PlugLinkEvent::MessageFailed {
                                    connection_id,
                                    envelope_id,
                                    reason: e.to_string(),
                                    timestamp: chrono::Utc::now().timestamp_millis(),
                                },
                                EVENT_SOURCE,
                            );
                            break;
                        }
                    }
                }
                inbound = link.recv() => {
                    match inbound {
                        Some(Ok(text)) => Inner::on_frame(&inner, connection_id, &text),
                        Some(Err(e)) => {
                            tracing::warn!(
                                connection_id = %connection_id,
                                error = %e,
                                "link read error"
                            );
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if link.ping().await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = link.close().await;
        Inner::on_link_closed(&inner, connection_id).await;
    }

    /// Validate and publish one inbound frame. Malformed frames are dropped.
    fn on_frame(inner: &Arc<Inner>, connection_id: Uuid, text: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(payload) => {
                inner.bus.publish_with_source(
                    PlugLinkEvent::MessageReceived {
                        connection_id,
                        payload,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    },
                    EVENT_SOURCE,
                );
            }
            Err(e) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    error = %e,
                    "dropping malformed inbound frame"
                );
            }
        }
    }

    /// Handle an unexpected link close: publish and enter the reconnect
    /// cycle unless the close was deliberate.
    async fn on_link_closed(inner: &Arc<Inner>, connection_id: Uuid) {
        {
            let mut connections = inner.connections.write().await;
            let Some(entry) = connections.get_mut(&connection_id) else {
                return;
            };
            if !matches!(
                entry.record.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            ) {
                return;
            }
            entry.outbound = None;
            entry.io_task = None;
        }

        tracing::warn!(connection_id = %connection_id, "link closed unexpectedly");
        inner.bus.publish_with_source(
            PlugLinkEvent::ConnectionClosed {
                connection_id,
                reason: Some("link closed".to_string()),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            EVENT_SOURCE,
        );
        Inner::schedule_reconnect(inner, connection_id).await;
    }

    /// Count an attempt and either mark the connection failed or schedule
    /// the next try with exponential backoff plus jitter.
    async fn schedule_reconnect(inner: &Arc<Inner>, connection_id: Uuid) {
        let mut connections = inner.connections.write().await;
        let Some(entry) = connections.get_mut(&connection_id) else {
            return;
        };

        entry.record.reconnect_attempts += 1;
        let attempt = entry.record.reconnect_attempts;

        if attempt > entry.config.max_reconnect_attempts {
            entry.transition(ConnectionStatus::Failed);
            entry.outbound = None;
            tracing::error!(
                connection_id = %connection_id,
                attempts = entry.config.max_reconnect_attempts,
                "reconnect budget exhausted, connection failed"
            );
            inner.bus.publish_with_source(
                PlugLinkEvent::ConnectionFailed {
                    connection_id,
                    attempts: entry.config.max_reconnect_attempts,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
                EVENT_SOURCE,
            );
            return;
        }

        if !entry.transition(ConnectionStatus::Reconnecting) {
            return;
        }

        let shift = (attempt - 1).min(10);
        let backoff = entry.config.reconnect_interval.saturating_mul(1 << shift);
        let jitter = std::time::Duration::from_millis(rand::random::<u64>() % 250);
        let delay = backoff + jitter;

        tracing::info!(
            connection_id = %connection_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        inner.bus.publish_with_source(
            PlugLinkEvent::ConnectionReconnecting {
                connection_id,
                attempt,
                delay_ms: delay.as_millis() as u64,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            EVENT_SOURCE,
        );

        // Boxed because the retry re-enters try_open, which spawned this
        // task: the future type must not be self-referential
        let retry_inner = inner.clone();
        let retry: BoxFuture<'static, ()> = Box::pin(async move {
            tokio::time::sleep(delay).await;
            Inner::try_open(&retry_inner, connection_id).await;
        });
        entry.reconnect_task = Some(tokio::spawn(retry));
    }

    /// One drain tick: hand queued envelopes to their io tasks, re-queueing
    /// what cannot go out yet.
    async fn drain_once(inner: &Arc<Inner>) {
        let batch = inner.queue.len().await;
        if batch == 0 {
            return;
        }

        let mut requeue = Vec::new();
        for _ in 0..batch {
            let Some(mut envelope) = inner.queue.dequeue().await else {
                break;
            };
            let connection_id = envelope.connection_id;

            let outbound = {
                let connections = inner.connections.read().await;
                match connections.get(&connection_id) {
                    // Connection forgotten: drop silently
                    None => continue,
                    Some(entry) if entry.record.status == ConnectionStatus::Connected => {
                        entry.outbound.clone()
                    }
                    Some(_) => None,
                }
            };

            let Some(tx) = outbound else {
                // Not connected yet: retry on a later tick, up to the cap
                envelope.retry_count += 1;
                if envelope.retry_count >= timing::MAX_SEND_RETRIES {
                    inner.bus.publish_with_source(
                        PlugLinkEvent::MessageFailed {
                            connection_id,
                            envelope_id: envelope.id,
                            reason: "connection unavailable".to_string(),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        },
                        EVENT_SOURCE,
                    );
                } else {
                    requeue.push(envelope);
                }
                continue;
            };

            if !inner.limiter.consume(connection_id, 1.0).await {
                tracing::debug!(
                    connection_id = %connection_id,
                    envelope_id = %envelope.id,
                    "rate limit exceeded, dropping envelope"
                );
                continue;
            }

            let text = match serde_json::to_string(&envelope.payload) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(envelope_id = %envelope.id, error = %e, "unserializable payload");
                    continue;
                }
            };

            if tx.send((envelope.id, text)).await.is_err() {
                // Io task went away between the status check and the send
                envelope.retry_count += 1;
                if envelope.retry_count < timing::MAX_SEND_RETRIES {
                    requeue.push(envelope);
                }
            }
        }

        for envelope in requeue {
            let _ = inner.queue.enqueue(envelope).await;
        }
    }
}
