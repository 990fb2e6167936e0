//! PlugLink core primitives.
//!
//! The leaf utilities every other PlugLink crate builds on:
//! - **EventBus**: typed publish/subscribe for connection, message, device,
//!   and session lifecycle events
//! - **PriorityMessageQueue**: bounded four-level outbound buffer
//! - **TokenBucketRateLimiter**: per-connection send-rate guard
//! - **config**: the workspace's timing and threshold defaults

pub mod config;
pub mod event;
pub mod eventbus;
pub mod logging;
pub mod queue;
pub mod ratelimit;

pub use event::{EventMetadata, PlugLinkEvent};
pub use eventbus::{EventBus, EventBusReceiver, FilterBuilder, FilteredReceiver, SharedEventBus};
pub use logging::init_tracing;
pub use queue::{MessageEnvelope, MessagePriority, PriorityMessageQueue, QueueError};
pub use ratelimit::TokenBucketRateLimiter;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
