//! Event bus for the PlugLink event-driven architecture.
//!
//! All components communicate by publishing and subscribing to events. The
//! bus is the only coupling point between the connection layer, the device
//! adapters, the liveness tracker, and the session services.

use crate::event::{EventMetadata, PlugLinkEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Typed publish/subscribe hub.
///
/// Built on a broadcast channel: every subscriber sees every published
/// event. Subscriptions are revoked by dropping the receiver, so connection
/// teardown cannot leak listeners.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(PlugLinkEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow
    /// subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    /// Get the name of this event bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber; with no
    /// subscribers the event is discarded.
    pub fn publish(&self, event: PlugLinkEvent) -> bool {
        self.publish_with_source(event, "system")
    }

    /// Publish an event with a custom source.
    pub fn publish_with_source(&self, event: PlugLinkEvent, source: impl Into<String>) -> bool {
        let metadata = EventMetadata::new(source);
        self.publish_with_metadata(event, metadata)
    }

    /// Publish an event with custom metadata.
    pub fn publish_with_metadata(&self, event: PlugLinkEvent, metadata: EventMetadata) -> bool {
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    ///
    /// Only events for which the filter returns `true` are delivered.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&PlugLinkEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }

    /// Create a filtered subscription helper for common patterns.
    pub fn filter(&self) -> FilterBuilder {
        FilterBuilder {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(PlugLinkEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<(PlugLinkEvent, EventMetadata)> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // We missed some events, but can continue receiving
                self.rx.try_recv().ok()
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(PlugLinkEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&PlugLinkEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(PlugLinkEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&PlugLinkEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<(PlugLinkEvent, EventMetadata)>, filter: F) -> Self {
        Self { rx, filter }
    }

    /// Receive the next event matching the filter.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<(PlugLinkEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(PlugLinkEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}

/// Builder for creating filtered subscriptions.
pub struct FilterBuilder {
    tx: broadcast::Sender<(PlugLinkEvent, EventMetadata)>,
}

impl FilterBuilder {
    /// Subscribe to connection lifecycle events only.
    pub fn connection_events(&self) -> FilteredReceiver<fn(&PlugLinkEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), PlugLinkEvent::is_connection_event)
    }

    /// Subscribe to message flow events only.
    pub fn message_events(&self) -> FilteredReceiver<fn(&PlugLinkEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), PlugLinkEvent::is_message_event)
    }

    /// Subscribe to device status/liveness events only.
    pub fn device_events(&self) -> FilteredReceiver<fn(&PlugLinkEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), PlugLinkEvent::is_device_event)
    }

    /// Subscribe to usage session events only.
    pub fn session_events(&self) -> FilteredReceiver<fn(&PlugLinkEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), PlugLinkEvent::is_session_event)
    }

    /// Subscribe to inbound messages for a single connection.
    pub fn messages_for(
        &self,
        connection_id: uuid::Uuid,
    ) -> FilteredReceiver<impl Fn(&PlugLinkEvent) -> bool + Send + 'static> {
        FilteredReceiver::new(self.tx.subscribe(), move |event| {
            matches!(event, PlugLinkEvent::MessageReceived { connection_id: id, .. } if *id == connection_id)
        })
    }

    /// Subscribe with a custom filter function.
    pub fn custom<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&PlugLinkEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;
