//! Event model shared by all PlugLink components.
//!
//! Every lifecycle change in the system — connection state, message flow,
//! device liveness, usage sessions — is expressed as a [`PlugLinkEvent`] and
//! distributed through the event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub id: Uuid,
    /// Component that published the event.
    pub source: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl EventMetadata {
    /// Create metadata with the current timestamp.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Events published on the PlugLink event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlugLinkEvent {
    /// A connection reached the `Connected` state.
    ConnectionOpened {
        connection_id: Uuid,
        url: String,
        timestamp: i64,
    },
    /// A connection was closed (expected or not).
    ConnectionClosed {
        connection_id: Uuid,
        reason: Option<String>,
        timestamp: i64,
    },
    /// A connection is waiting out a backoff delay before a retry.
    ConnectionReconnecting {
        connection_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        timestamp: i64,
    },
    /// A connection exhausted its reconnect budget.
    ConnectionFailed {
        connection_id: Uuid,
        attempts: u32,
        timestamp: i64,
    },

    /// An inbound frame was parsed and accepted.
    MessageReceived {
        connection_id: Uuid,
        payload: serde_json::Value,
        timestamp: i64,
    },
    /// An outbound envelope was written to the transport.
    MessageSent {
        connection_id: Uuid,
        envelope_id: Uuid,
        timestamp: i64,
    },
    /// An outbound envelope was dropped after exhausting retries.
    MessageFailed {
        connection_id: Uuid,
        envelope_id: Uuid,
        reason: String,
        timestamp: i64,
    },

    /// Fresh canonical status for a device.
    DeviceUpdate {
        device_id: String,
        status: serde_json::Value,
        timestamp: i64,
    },
    /// A device came online.
    DeviceOnline { device_id: String, timestamp: i64 },
    /// A device was marked offline.
    DeviceOffline {
        device_id: String,
        reason: Option<String>,
        timestamp: i64,
    },
    /// A device's power reading went stale and was cleared.
    ConsumptionCleared {
        device_id: String,
        last_watts: Option<f64>,
        timestamp: i64,
    },

    /// A usage session was opened for a device.
    SessionOpened {
        session_id: Uuid,
        device_id: String,
        appointment_id: String,
        timestamp: i64,
    },
    /// A usage session reached a terminal state.
    SessionClosed {
        session_id: Uuid,
        device_id: String,
        status: String,
        timestamp: i64,
    },
    /// Actual usage exceeded the appointment estimate.
    ComplianceAlert {
        session_id: Uuid,
        device_id: String,
        severity: String,
        overage_minutes: i64,
        timestamp: i64,
    },
}

impl PlugLinkEvent {
    /// Variant name, for logging and assertions.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionOpened { .. } => "ConnectionOpened",
            Self::ConnectionClosed { .. } => "ConnectionClosed",
            Self::ConnectionReconnecting { .. } => "ConnectionReconnecting",
            Self::ConnectionFailed { .. } => "ConnectionFailed",
            Self::MessageReceived { .. } => "MessageReceived",
            Self::MessageSent { .. } => "MessageSent",
            Self::MessageFailed { .. } => "MessageFailed",
            Self::DeviceUpdate { .. } => "DeviceUpdate",
            Self::DeviceOnline { .. } => "DeviceOnline",
            Self::DeviceOffline { .. } => "DeviceOffline",
            Self::ConsumptionCleared { .. } => "ConsumptionCleared",
            Self::SessionOpened { .. } => "SessionOpened",
            Self::SessionClosed { .. } => "SessionClosed",
            Self::ComplianceAlert { .. } => "ComplianceAlert",
        }
    }

    /// Connection lifecycle events.
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            Self::ConnectionOpened { .. }
                | Self::ConnectionClosed { .. }
                | Self::ConnectionReconnecting { .. }
                | Self::ConnectionFailed { .. }
        )
    }

    /// Message flow events.
    pub fn is_message_event(&self) -> bool {
        matches!(
            self,
            Self::MessageReceived { .. } | Self::MessageSent { .. } | Self::MessageFailed { .. }
        )
    }

    /// Device status and liveness events.
    pub fn is_device_event(&self) -> bool {
        matches!(
            self,
            Self::DeviceUpdate { .. }
                | Self::DeviceOnline { .. }
                | Self::DeviceOffline { .. }
                | Self::ConsumptionCleared { .. }
        )
    }

    /// Usage session and compliance events.
    pub fn is_session_event(&self) -> bool {
        matches!(
            self,
            Self::SessionOpened { .. }
                | Self::SessionClosed { .. }
                | Self::ComplianceAlert { .. }
        )
    }

    /// The connection this event concerns, if any.
    pub fn connection_id(&self) -> Option<Uuid> {
        match self {
            Self::ConnectionOpened { connection_id, .. }
            | Self::ConnectionClosed { connection_id, .. }
            | Self::ConnectionReconnecting { connection_id, .. }
            | Self::ConnectionFailed { connection_id, .. }
            | Self::MessageReceived { connection_id, .. }
            | Self::MessageSent { connection_id, .. }
            | Self::MessageFailed { connection_id, .. } => Some(*connection_id),
            _ => None,
        }
    }

    /// The device this event concerns, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceUpdate { device_id, .. }
            | Self::DeviceOnline { device_id, .. }
            | Self::DeviceOffline { device_id, .. }
            | Self::ConsumptionCleared { device_id, .. }
            | Self::SessionOpened { device_id, .. }
            | Self::SessionClosed { device_id, .. }
            | Self::ComplianceAlert { device_id, .. } => Some(device_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_classification() {
        let event = PlugLinkEvent::ConnectionOpened {
            connection_id: Uuid::new_v4(),
            url: "wss://example".to_string(),
            timestamp: 0,
        };
        assert!(event.is_connection_event());
        assert!(!event.is_device_event());
        assert_eq!(event.type_name(), "ConnectionOpened");

        let event = PlugLinkEvent::DeviceOffline {
            device_id: "plug-1".to_string(),
            reason: Some("state_timeout".to_string()),
            timestamp: 0,
        };
        assert!(event.is_device_event());
        assert_eq!(event.device_id(), Some("plug-1"));
    }

    #[test]
    fn test_metadata_source() {
        let meta = EventMetadata::new("tracker");
        assert_eq!(meta.source, "tracker");
        assert!(meta.timestamp > 0);
    }
}
