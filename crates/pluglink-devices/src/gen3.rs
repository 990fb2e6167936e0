//! Gen3 adapter: Gen2 RPC plus the plug UI component.
//!
//! Gen3 plugs carry an LED ring controlled through `PLUGS_UI.SetConfig`.
//! Everything else delegates to the Gen2 encoding.

use crate::error::ProtocolResult;
use crate::gen2::{self, Gen2Adapter};
use crate::protocol::{
    CloudCall, CommandRequest, Generation, IndicatorMode, LocalCall, ProtocolAdapter,
};
use crate::status::DeviceStatus;
use serde_json::{json, Value};

pub const PLUGS_UI_SET_CONFIG: &str = "PLUGS_UI.SetConfig";

pub struct Gen3Adapter;

/// LED config marking a running usage session: steady green when on.
pub fn session_indicator_config() -> Value {
    json!({
        "config": {
            "leds": {
                "mode": "switch",
                "colors": {
                    "switch:0": {
                        "on": {"rgb": [0, 100, 0], "brightness": 70},
                        "off": {"rgb": [0, 20, 60], "brightness": 20}
                    }
                }
            }
        }
    })
}

/// LED config for a compliance alert: red at full brightness.
pub fn alert_indicator_config() -> Value {
    json!({
        "config": {
            "leds": {
                "mode": "switch",
                "colors": {
                    "switch:0": {
                        "on": {"rgb": [100, 0, 0], "brightness": 100},
                        "off": {"rgb": [100, 0, 0], "brightness": 40}
                    }
                }
            }
        }
    })
}

/// Factory LED behavior: brightness tracks power draw.
pub fn default_indicator_config() -> Value {
    json!({
        "config": {
            "leds": {
                "mode": "power"
            }
        }
    })
}

impl ProtocolAdapter for Gen3Adapter {
    fn generation(&self) -> Generation {
        Generation::Gen3
    }

    fn set_power(&self, channel: u8, on: bool, timer_s: Option<u32>) -> CommandRequest {
        Gen2Adapter.set_power(channel, on, timer_s)
    }

    fn toggle(&self, channel: u8) -> CommandRequest {
        Gen2Adapter.toggle(channel)
    }

    fn get_status(&self, channel: u8) -> CommandRequest {
        Gen2Adapter.get_status(channel)
    }

    fn reset_counters(&self, channel: u8) -> ProtocolResult<CommandRequest> {
        Gen2Adapter.reset_counters(channel)
    }

    fn set_auto_off(
        &self,
        channel: u8,
        enabled: bool,
        delay_s: Option<u32>,
    ) -> ProtocolResult<CommandRequest> {
        Gen2Adapter.set_auto_off(channel, enabled, delay_s)
    }

    fn set_indicator(&self, mode: IndicatorMode) -> ProtocolResult<CommandRequest> {
        let params = match mode {
            IndicatorMode::Session => session_indicator_config(),
            IndicatorMode::Alert => alert_indicator_config(),
            IndicatorMode::Default => default_indicator_config(),
        };
        Ok(CommandRequest {
            local: LocalCall::Rpc {
                method: PLUGS_UI_SET_CONFIG,
                params: params.clone(),
            },
            cloud: CloudCall::Rpc {
                method: PLUGS_UI_SET_CONFIG,
                params,
            },
        })
    }

    fn parse_status(&self, payload: &Value) -> ProtocolResult<DeviceStatus> {
        gen2::parse_switch_status(payload)
    }

    fn parse_notification(&self, frame: &Value) -> Option<DeviceStatus> {
        gen2::parse_notification_frame(frame)
    }
}
