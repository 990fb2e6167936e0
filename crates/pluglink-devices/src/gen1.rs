//! Gen1 adapter: stateless HTTP REST devices.
//!
//! Gen1 plugs expose simple GET endpoints (`/relay/{ch}`, `/meter/{ch}`,
//! `/status`, `/settings`) and report accumulated energy in watt-minutes.
//! They never push notifications over the cloud socket.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{
    CloudCall, CommandRequest, Generation, IndicatorMode, LocalCall, ProtocolAdapter,
};
use crate::status::{DeviceStatus, PowerReadings, RelayState, WifiInfo};
use serde_json::Value;

/// Watt-minutes per kWh.
const WATT_MINUTES_PER_KWH: f64 = 60_000.0;

/// Convert a Gen1 meter total (watt-minutes) to kWh.
pub fn watt_minutes_to_kwh(watt_minutes: f64) -> f64 {
    watt_minutes / WATT_MINUTES_PER_KWH
}

/// Convert kWh back to a Gen1 meter total (watt-minutes).
pub fn kwh_to_watt_minutes(kwh: f64) -> f64 {
    kwh * WATT_MINUTES_PER_KWH
}

pub struct Gen1Adapter;

impl ProtocolAdapter for Gen1Adapter {
    fn generation(&self) -> Generation {
        Generation::Gen1
    }

    fn set_power(&self, channel: u8, on: bool, timer_s: Option<u32>) -> CommandRequest {
        let turn = if on { "on" } else { "off" };
        let mut path = format!("/relay/{channel}?turn={turn}");
        if let Some(timer) = timer_s {
            path.push_str(&format!("&timer={timer}"));
        }
        CommandRequest {
            local: LocalCall::Get { path },
            cloud: CloudCall::RelayControl {
                turn: if on { "on" } else { "off" },
                channel,
            },
        }
    }

    fn toggle(&self, channel: u8) -> CommandRequest {
        CommandRequest {
            local: LocalCall::Get {
                path: format!("/relay/{channel}?turn=toggle"),
            },
            cloud: CloudCall::RelayControl {
                turn: "toggle",
                channel,
            },
        }
    }

    fn get_status(&self, _channel: u8) -> CommandRequest {
        CommandRequest {
            local: LocalCall::Get {
                path: "/status".to_string(),
            },
            cloud: CloudCall::StatusQuery,
        }
    }

    fn reset_counters(&self, channel: u8) -> ProtocolResult<CommandRequest> {
        Ok(CommandRequest {
            local: LocalCall::Get {
                path: format!("/meter/{channel}?reset=true"),
            },
            // The cloud API has no counter reset for Gen1
            cloud: CloudCall::Unavailable,
        })
    }

    fn set_auto_off(
        &self,
        _channel: u8,
        _enabled: bool,
        _delay_s: Option<u32>,
    ) -> ProtocolResult<CommandRequest> {
        // Gen1 only supports one-shot timers on individual relay commands
        Err(ProtocolError::Unsupported("gen1 auto-off config"))
    }

    fn set_indicator(&self, _mode: IndicatorMode) -> ProtocolResult<CommandRequest> {
        Err(ProtocolError::Unsupported("gen1 indicator"))
    }

    /// Parse a Gen1 `/status` payload.
    fn parse_status(&self, payload: &Value) -> ProtocolResult<DeviceStatus> {
        let relay = payload
            .get("relays")
            .and_then(|r| r.get(0))
            .ok_or_else(|| ProtocolError::Malformed("gen1 status without relays".to_string()))?;
        let meter = payload.get("meters").and_then(|m| m.get(0));

        let relay = RelayState {
            is_on: relay.get("ison").and_then(Value::as_bool).unwrap_or(false),
            source: relay
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        let power = PowerReadings {
            current: meter.and_then(|m| m.get("power")).and_then(Value::as_f64),
            voltage: payload.get("voltage").and_then(Value::as_f64),
            total: meter
                .and_then(|m| m.get("total"))
                .and_then(Value::as_f64)
                .map(watt_minutes_to_kwh),
            temperature: payload.get("temperature").and_then(Value::as_f64),
        };

        let wifi = payload.get("wifi_sta").map(|w| WifiInfo {
            ssid: w.get("ssid").and_then(Value::as_str).map(str::to_string),
            rssi: w.get("rssi").and_then(Value::as_i64),
            ip: w.get("ip").and_then(Value::as_str).map(str::to_string),
        });

        let cloud_connected = payload
            .get("cloud")
            .and_then(|c| c.get("connected"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(DeviceStatus {
            online: true,
            relay,
            power,
            wifi,
            cloud_connected,
            last_update: chrono::Utc::now(),
        })
    }

    fn parse_notification(&self, _frame: &Value) -> Option<DeviceStatus> {
        // Gen1 devices do not push frames over the cloud socket
        None
    }
}
