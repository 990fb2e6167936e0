//! Per-connection configuration.

use pluglink_core::config::connection as defaults;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Rate-limit ceiling for one connection's outbound traffic.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Burst capacity in messages.
    pub capacity: f64,
    /// Sustained rate in messages per second.
    pub per_second: f64,
}

/// Settings for a managed connection.
///
/// Everything except the endpoint URL has a workspace-wide default; callers
/// override with the `with_*` builders.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint to connect to.
    pub url: Url,
    /// Base delay between reconnect attempts. Doubles per attempt.
    pub reconnect_interval: Duration,
    /// Reconnect attempts before the connection is marked failed.
    pub max_reconnect_attempts: u32,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
    /// Maximum queued outbound messages for this connection.
    pub queue_capacity: usize,
    /// Optional per-connection rate-limit ceiling.
    pub rate_limit: Option<RateLimit>,
    /// Tags for targeted broadcast.
    pub tags: Vec<String>,
    /// Opaque caller metadata, echoed in connection snapshots.
    pub metadata: Value,
}

impl ConnectionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_interval: defaults::DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: defaults::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ping_interval: defaults::DEFAULT_PING_INTERVAL,
            queue_capacity: defaults::DEFAULT_CONNECTION_QUEUE_CAPACITY,
            rate_limit: None,
            tags: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_rate_limit(mut self, capacity: f64, per_second: f64) -> Self {
        self.rate_limit = Some(RateLimit {
            capacity,
            per_second,
        });
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
