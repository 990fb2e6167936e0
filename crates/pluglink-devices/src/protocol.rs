//! Generation-tagged protocol dispatch.
//!
//! A device's generation is resolved once, to a [`Generation`] tag, and the
//! tag selects a concrete [`ProtocolAdapter`]. All generation-specific
//! knowledge (paths, RPC methods, payload shapes) lives behind the adapter;
//! callers work only with [`CommandRequest`] and the canonical status.

use crate::error::{ProtocolError, ProtocolResult};
use crate::status::DeviceStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Device protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Generation {
    /// HTTP REST devices (original plugs).
    Gen1,
    /// JSON-RPC 2.0 devices.
    Gen2,
    /// JSON-RPC devices with the plug UI component (LED ring).
    Gen3,
}

impl Generation {
    /// Whether the device speaks JSON-RPC.
    pub fn is_rpc(self) -> bool {
        matches!(self, Self::Gen2 | Self::Gen3)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gen1 => f.write_str("gen1"),
            Self::Gen2 => f.write_str("gen2"),
            Self::Gen3 => f.write_str("gen3"),
        }
    }
}

impl FromStr for Generation {
    type Err = ProtocolError;

    /// Accepts the spellings seen in device records: `1`, `G1`, `gen1`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "g1" | "gen1" => Ok(Self::Gen1),
            "2" | "g2" | "gen2" => Ok(Self::Gen2),
            "3" | "g3" | "gen3" => Ok(Self::Gen3),
            other => Err(ProtocolError::Malformed(format!(
                "unknown generation: {other}"
            ))),
        }
    }
}

/// LED indicator states for Gen3 plugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorMode {
    /// A usage session is running on this plug.
    Session,
    /// Compliance alert; draws attention at the device.
    Alert,
    /// Restore the factory LED behavior.
    Default,
}

/// How to issue a command against the device's local address.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalCall {
    /// Gen1: `GET http://{addr}{path}`.
    Get { path: String },
    /// Gen2/3: JSON-RPC over `POST http://{addr}/rpc`.
    Rpc { method: &'static str, params: Value },
}

/// How to issue the same command through the tenant's cloud API.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    /// `POST {host}/device/rpc/{device_id}` with `{method, params}`.
    Rpc { method: &'static str, params: Value },
    /// Gen1 relay control: `POST {host}/device/relay/control`.
    RelayControl { turn: &'static str, channel: u8 },
    /// Gen1 status query: `POST {host}/device/status`.
    StatusQuery,
    /// No cloud equivalent exists.
    Unavailable,
}

/// A command expressed in both delivery forms.
///
/// The commander decides at dispatch time which form to use; the adapter
/// only states what each form looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub local: LocalCall,
    pub cloud: CloudCall,
}

/// One protocol generation's encoding and decoding rules.
pub trait ProtocolAdapter: Send + Sync {
    fn generation(&self) -> Generation;

    /// Turn the relay on or off, optionally with a device-side timer.
    fn set_power(&self, channel: u8, on: bool, timer_s: Option<u32>) -> CommandRequest;

    /// Flip the relay.
    fn toggle(&self, channel: u8) -> CommandRequest;

    /// Full device status.
    fn get_status(&self, channel: u8) -> CommandRequest;

    /// Zero the energy counter.
    fn reset_counters(&self, channel: u8) -> ProtocolResult<CommandRequest>;

    /// Configure auto-off behavior.
    fn set_auto_off(
        &self,
        channel: u8,
        enabled: bool,
        delay_s: Option<u32>,
    ) -> ProtocolResult<CommandRequest>;

    /// Set the LED indicator. Only Gen3 supports this.
    fn set_indicator(&self, mode: IndicatorMode) -> ProtocolResult<CommandRequest>;

    /// Normalize a full status payload.
    fn parse_status(&self, payload: &Value) -> ProtocolResult<DeviceStatus>;

    /// Normalize an unsolicited cloud frame, if this adapter recognizes it.
    fn parse_notification(&self, frame: &Value) -> Option<DeviceStatus>;
}

/// The adapter for a generation. Adapters are stateless.
pub fn adapter_for(generation: Generation) -> &'static dyn ProtocolAdapter {
    match generation {
        Generation::Gen1 => &crate::gen1::Gen1Adapter,
        Generation::Gen2 => &crate::gen2::Gen2Adapter,
        Generation::Gen3 => &crate::gen3::Gen3Adapter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_spellings() {
        assert_eq!("1".parse::<Generation>().unwrap(), Generation::Gen1);
        assert_eq!("G1".parse::<Generation>().unwrap(), Generation::Gen1);
        assert_eq!("gen2".parse::<Generation>().unwrap(), Generation::Gen2);
        assert_eq!("G3".parse::<Generation>().unwrap(), Generation::Gen3);
        assert!("4".parse::<Generation>().is_err());
        assert!(!Generation::Gen1.is_rpc());
        assert!(Generation::Gen3.is_rpc());
    }

    #[test]
    fn test_adapter_dispatch_is_tagged() {
        for generation in [Generation::Gen1, Generation::Gen2, Generation::Gen3] {
            assert_eq!(adapter_for(generation).generation(), generation);
        }
    }
}
