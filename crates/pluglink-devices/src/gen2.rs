//! Gen2 adapter: JSON-RPC 2.0 devices.
//!
//! Gen2 plugs speak `{id, method, params}` / `{id, result|error}` both over
//! local HTTP (`POST /rpc`) and through the cloud socket. Unsolicited cloud
//! frames arrive as `{src, dst, method: "NotifyStatus"|"NotifyFullStatus",
//! params}` and normalize to the canonical status like any polled payload.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{
    CloudCall, CommandRequest, Generation, IndicatorMode, LocalCall, ProtocolAdapter,
};
use crate::status::{DeviceStatus, PowerReadings, RelayState, WifiInfo};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// RPC method names.
pub mod methods {
    pub const SWITCH_SET: &str = "Switch.Set";
    pub const SWITCH_TOGGLE: &str = "Switch.Toggle";
    pub const SWITCH_GET_STATUS: &str = "Switch.GetStatus";
    pub const SWITCH_SET_CONFIG: &str = "Switch.SetConfig";
    pub const SWITCH_RESET_COUNTERS: &str = "Switch.ResetCounters";
    pub const SYS_SET_CONFIG: &str = "Sys.SetConfig";
    pub const SHELLY_GET_STATUS: &str = "Shelly.GetStatus";
    pub const SHELLY_GET_DEVICE_INFO: &str = "Shelly.GetDeviceInfo";
    pub const SHELLY_UPDATE: &str = "Shelly.Update";
    pub const WIFI_GET_CONFIG: &str = "Wifi.GetConfig";
    pub const WIFI_SET_CONFIG: &str = "Wifi.SetConfig";
    pub const SCHEDULE_CREATE: &str = "Schedule.Create";
    pub const SCHEDULE_LIST: &str = "Schedule.List";
    pub const SCHEDULE_DELETE: &str = "Schedule.Delete";
    pub const NOTIFY_STATUS: &str = "NotifyStatus";
    pub const NOTIFY_FULL_STATUS: &str = "NotifyFullStatus";
}

/// Outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Inbound JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// RPC-level error body.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

pub struct Gen2Adapter;

fn rpc(method: &'static str, params: Value) -> CommandRequest {
    CommandRequest {
        local: LocalCall::Rpc {
            method,
            params: params.clone(),
        },
        cloud: CloudCall::Rpc { method, params },
    }
}

impl ProtocolAdapter for Gen2Adapter {
    fn generation(&self) -> Generation {
        Generation::Gen2
    }

    fn set_power(&self, channel: u8, on: bool, timer_s: Option<u32>) -> CommandRequest {
        let mut params = json!({ "id": channel, "on": on });
        if let Some(timer) = timer_s {
            params["toggle_after"] = json!(timer);
        }
        rpc(methods::SWITCH_SET, params)
    }

    fn toggle(&self, channel: u8) -> CommandRequest {
        rpc(methods::SWITCH_TOGGLE, json!({ "id": channel }))
    }

    fn get_status(&self, _channel: u8) -> CommandRequest {
        rpc(methods::SHELLY_GET_STATUS, json!({}))
    }

    fn reset_counters(&self, channel: u8) -> ProtocolResult<CommandRequest> {
        Ok(rpc(
            methods::SWITCH_RESET_COUNTERS,
            json!({ "id": channel, "type": ["aenergy"] }),
        ))
    }

    fn set_auto_off(
        &self,
        channel: u8,
        enabled: bool,
        delay_s: Option<u32>,
    ) -> ProtocolResult<CommandRequest> {
        let mut config = json!({ "auto_off": enabled });
        if let Some(delay) = delay_s {
            config["auto_off_delay"] = json!(delay);
        }
        Ok(rpc(
            methods::SWITCH_SET_CONFIG,
            json!({ "id": channel, "config": config }),
        ))
    }

    fn set_indicator(&self, _mode: IndicatorMode) -> ProtocolResult<CommandRequest> {
        Err(ProtocolError::Unsupported("gen2 indicator"))
    }

    fn parse_status(&self, payload: &Value) -> ProtocolResult<DeviceStatus> {
        parse_switch_status(payload)
    }

    fn parse_notification(&self, frame: &Value) -> Option<DeviceStatus> {
        parse_notification_frame(frame)
    }
}

// Maintenance and provisioning calls. These sit outside the adapter trait:
// they are identical for Gen2 and Gen3 and meaningless for Gen1, so the
// commander gates them on the generation instead.

/// `Shelly.GetDeviceInfo`: identity, model, firmware version.
pub fn device_info() -> CommandRequest {
    rpc(methods::SHELLY_GET_DEVICE_INFO, json!({}))
}

/// `Sys.SetConfig` with a new device name.
pub fn set_device_name(name: &str) -> CommandRequest {
    rpc(
        methods::SYS_SET_CONFIG,
        json!({ "config": { "device": { "name": name } } }),
    )
}

/// `Wifi.GetConfig`: current station settings.
pub fn wifi_config() -> CommandRequest {
    rpc(methods::WIFI_GET_CONFIG, json!({}))
}

/// `Wifi.SetConfig` enabling the station with the given credentials.
pub fn set_wifi_sta(ssid: &str, password: &str) -> CommandRequest {
    rpc(
        methods::WIFI_SET_CONFIG,
        json!({ "config": { "sta": { "ssid": ssid, "pass": password, "enable": true } } }),
    )
}

/// `Schedule.List`.
pub fn schedule_list() -> CommandRequest {
    rpc(methods::SCHEDULE_LIST, json!({}))
}

/// `Schedule.Create` with a single call fired on the cron-style timespec.
pub fn schedule_create(timespec: &str, method: &str, params: Value) -> CommandRequest {
    rpc(
        methods::SCHEDULE_CREATE,
        json!({
            "enable": true,
            "timespec": timespec,
            "calls": [{ "method": method, "params": params }],
        }),
    )
}

/// `Schedule.Delete` by job id.
pub fn schedule_delete(id: u64) -> CommandRequest {
    rpc(methods::SCHEDULE_DELETE, json!({ "id": id }))
}

/// `Shelly.Update` to the given firmware stage (`stable` or `beta`).
pub fn firmware_update(stage: &str) -> CommandRequest {
    rpc(methods::SHELLY_UPDATE, json!({ "stage": stage }))
}

/// Map a payload containing a `switch:0` component to the canonical status.
///
/// Accepts both full `Shelly.GetStatus` payloads and the component-only
/// shape of `Switch.GetStatus` results.
pub(crate) fn parse_switch_status(payload: &Value) -> ProtocolResult<DeviceStatus> {
    let switch = payload
        .get("switch:0")
        .or_else(|| {
            // Switch.GetStatus returns the component directly
            payload.get("output").map(|_| payload)
        })
        .ok_or_else(|| ProtocolError::Malformed("payload without switch:0".to_string()))?;

    let relay = RelayState {
        is_on: switch
            .get("output")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        source: switch
            .get("source")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    let power = PowerReadings {
        current: switch.get("apower").and_then(Value::as_f64),
        voltage: switch.get("voltage").and_then(Value::as_f64),
        // aenergy.total is Wh
        total: switch
            .get("aenergy")
            .and_then(|e| e.get("total"))
            .and_then(Value::as_f64)
            .map(|wh| wh / 1000.0),
        temperature: switch
            .get("temperature")
            .and_then(|t| t.get("tC"))
            .and_then(Value::as_f64),
    };

    let wifi = payload.get("wifi").map(|w| WifiInfo {
        ssid: w.get("ssid").and_then(Value::as_str).map(str::to_string),
        rssi: w.get("rssi").and_then(Value::as_i64),
        ip: w.get("sta_ip").and_then(Value::as_str).map(str::to_string),
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

/// Normalize an unsolicited `NotifyStatus`/`NotifyFullStatus` frame.
pub(crate) fn parse_notification_frame(frame: &Value) -> Option<DeviceStatus> {
    let method = frame.get("method").and_then(Value::as_str)?;
    if method != methods::NOTIFY_STATUS && method != methods::NOTIFY_FULL_STATUS {
        return None;
    }
    let params = frame.get("params")?;
    parse_switch_status(params).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_status() -> Value {
        json!({
            "switch:0": {
                "output": true,
                "source": "WS_in",
                "apower": 61.2,
                "voltage": 229.8,
                "aenergy": {"total": 1500.0},
                "temperature": {"tC": 38.4}
            },
            "wifi": {"ssid": "clinic", "rssi": -61, "sta_ip": "192.168.1.51"},
            "cloud": {"connected": true}
        })
    }

    #[test]
    fn test_rpc_envelope_round_trip() {
        let request = RpcRequest::new(7, methods::SWITCH_SET, Some(json!({"id": 0, "on": true})));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({"id": 7, "method": "Switch.Set", "params": {"id": 0, "on": true}})
        );

        let response: RpcResponse =
            serde_json::from_value(json!({"id": 7, "result": {"was_on": false}})).unwrap();
        assert_eq!(response.id, 7);
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["was_on"], json!(false));

        let response: RpcResponse = serde_json::from_value(
            json!({"id": 8, "error": {"code": 401, "message": "unauthorized"}}),
        )
        .unwrap();
        assert_eq!(response.error.unwrap().code, 401);
    }

    #[test]
    fn test_set_power_builds_switch_set() {
        let request = Gen2Adapter.set_power(0, true, Some(1800));
        match request.local {
            LocalCall::Rpc { method, params } => {
                assert_eq!(method, methods::SWITCH_SET);
                assert_eq!(params, json!({"id": 0, "on": true, "toggle_after": 1800}));
            }
            other => panic!("unexpected local call {other:?}"),
        }
    }

    #[test]
    fn test_maintenance_builders() {
        match device_info().local {
            LocalCall::Rpc { method, params } => {
                assert_eq!(method, methods::SHELLY_GET_DEVICE_INFO);
                assert_eq!(params, json!({}));
            }
            other => panic!("unexpected local call {other:?}"),
        }

        match set_device_name("treatment-room-2").local {
            LocalCall::Rpc { method, params } => {
                assert_eq!(method, methods::SYS_SET_CONFIG);
                assert_eq!(
                    params,
                    json!({"config": {"device": {"name": "treatment-room-2"}}})
                );
            }
            other => panic!("unexpected local call {other:?}"),
        }

        match set_wifi_sta("clinic", "hunter2").local {
            LocalCall::Rpc { method, params } => {
                assert_eq!(method, methods::WIFI_SET_CONFIG);
                assert_eq!(params["config"]["sta"]["ssid"], json!("clinic"));
                assert_eq!(params["config"]["sta"]["enable"], json!(true));
            }
            other => panic!("unexpected local call {other:?}"),
        }

        match schedule_create("0 0 22 * * *", methods::SWITCH_SET, json!({"id": 0, "on": false}))
            .cloud
        {
            CloudCall::Rpc { method, params } => {
                assert_eq!(method, methods::SCHEDULE_CREATE);
                assert_eq!(params["timespec"], json!("0 0 22 * * *"));
                assert_eq!(params["calls"][0]["method"], json!("Switch.Set"));
            }
            other => panic!("unexpected cloud call {other:?}"),
        }

        match firmware_update("stable").local {
            LocalCall::Rpc { method, params } => {
                assert_eq!(method, methods::SHELLY_UPDATE);
                assert_eq!(params, json!({"stage": "stable"}));
            }
            other => panic!("unexpected local call {other:?}"),
        }
    }

    #[test]
    fn test_parse_full_status() {
        let status = Gen2Adapter.parse_status(&full_status()).unwrap();
        assert!(status.relay.is_on);
        assert_eq!(status.power.current, Some(61.2));
        assert_eq!(status.power.voltage, Some(229.8));
        // 1500 Wh is 1.5 kWh
        assert_eq!(status.power.total, Some(1.5));
        assert_eq!(status.power.temperature, Some(38.4));
        assert!(status.cloud_connected);
    }

    #[test]
    fn test_parse_notification() {
        let frame = json!({
            "src": "shellyplus1-abc",
            "dst": "app",
            "method": "NotifyStatus",
            "params": full_status()
        });
        let status = Gen2Adapter.parse_notification(&frame).unwrap();
        assert_eq!(status.power.current, Some(61.2));

        // Non-notification frames are ignored
        let frame = json!({"id": 1, "result": {"was_on": true}});
        assert!(Gen2Adapter.parse_notification(&frame).is_none());
    }
}
