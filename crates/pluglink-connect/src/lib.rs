//! Persistent connection layer for PlugLink.
//!
//! This crate keeps long-lived links to device cloud endpoints open:
//! connects with a timeout, reconnects with exponential backoff, queues
//! outbound messages by priority, rate-limits per connection, and publishes
//! every lifecycle change on the shared event bus. Tenant cloud credentials
//! live here too, since connections and device commands share them.

pub mod config;
pub mod credential;
pub mod error;
pub mod manager;
pub mod transport;

pub use config::{ConnectionConfig, RateLimit};
pub use credential::{Credential, SharedCredential, TokenPair, TokenRefresher};
pub use error::{ConnectError, ConnectResult};
pub use manager::{Connection, ConnectionManager, ConnectionStatus, ManagerMetrics};
pub use transport::{MemoryTransport, Transport, TransportLink, WsTransport};
