//! Canonical device status.
//!
//! Every generation's payload normalizes to [`DeviceStatus`]; nothing
//! downstream of the adapters ever sees a raw protocol payload. The most
//! recent inbound message always wins, regardless of which generation or
//! path produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relay (switch) state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayState {
    /// Whether the relay is conducting.
    pub is_on: bool,
    /// What last changed the relay: `http`, `button`, `timer`, ...
    pub source: Option<String>,
}

/// Power and energy readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReadings {
    /// Instantaneous draw in watts. `None` means "no data", which is
    /// distinct from `Some(0.0)`.
    pub current: Option<f64>,
    /// Line voltage in volts.
    pub voltage: Option<f64>,
    /// Accumulated energy in kWh.
    pub total: Option<f64>,
    /// Internal temperature in Celsius.
    pub temperature: Option<f64>,
}

/// WiFi association details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiInfo {
    pub ssid: Option<String>,
    pub rssi: Option<i64>,
    pub ip: Option<String>,
}

/// Normalized snapshot of a smart plug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub online: bool,
    pub relay: RelayState,
    pub power: PowerReadings,
    pub wifi: Option<WifiInfo>,
    pub cloud_connected: bool,
    pub last_update: DateTime<Utc>,
}

impl DeviceStatus {
    /// A fresh snapshot with no readings, marked online.
    pub fn online_now() -> Self {
        Self {
            online: true,
            relay: RelayState::default(),
            power: PowerReadings::default(),
            wifi: None,
            cloud_connected: false,
            last_update: Utc::now(),
        }
    }

    /// Whether the relay is on and drawing measurable power.
    pub fn has_measurable_draw(&self, threshold_w: f64) -> bool {
        self.relay.is_on && self.power.current.map(|w| w > threshold_w).unwrap_or(false)
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            online: false,
            relay: RelayState::default(),
            power: PowerReadings::default(),
            wifi: None,
            cloud_connected: false,
            last_update: Utc::now(),
        }
    }
}
