//! Tuning defaults shared across the workspace.
//!
//! Every timeout and topology constant lives here so call sites never
//! hardcode their own copies.

/// Connection manager timing.
pub mod connection {
    use std::time::Duration;

    /// A connect attempt that has not completed by now counts as a failure.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Fixed tick of the outbound drain loop.
    pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);
    /// Base delay for exponential reconnect backoff.
    pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
    /// Reconnect attempts before a connection becomes `Failed`.
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
    /// Default keepalive ping interval.
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
    /// Delivery attempts for a queued envelope before it is dropped.
    pub const MAX_SEND_RETRIES: u32 = 3;
    /// Pending outbound messages allowed per connection.
    pub const DEFAULT_CONNECTION_QUEUE_CAPACITY: usize = 100;
}

/// Device command timing.
pub mod command {
    use std::time::Duration;

    /// Timeout for the local-network attempt before falling back to cloud.
    pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(3);
    /// Timeout for the cloud RPC path.
    pub const CLOUD_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Liveness tracking windows.
pub mod liveness {
    use std::time::Duration;

    /// A power reading older than this is cleared to "no data".
    pub const CONSUMPTION_TIMEOUT: Duration = Duration::from_secs(12);
    /// A device silent for longer than this is marked offline.
    pub const STATE_TIMEOUT: Duration = Duration::from_secs(180);
    /// Tick of the explicit staleness sweep task.
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
}

/// Usage reconciliation thresholds.
pub mod usage {
    /// Watts above which the relay is considered actively drawing.
    pub const ACTIVE_POWER_THRESHOLD_W: f64 = 1.0;
    /// Overage in minutes above which a fraud alert is `High` severity.
    pub const HIGH_SEVERITY_OVERAGE_MIN: i64 = 30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_windows_are_decoupled() {
        // The consumption window must be much shorter than the state window
        assert!(liveness::CONSUMPTION_TIMEOUT < liveness::STATE_TIMEOUT);
        assert!(liveness::SWEEP_INTERVAL < liveness::STATE_TIMEOUT);
    }
}
