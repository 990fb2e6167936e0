//! Device command dispatch.
//!
//! One policy for every command, at every call site: try the device's local
//! address first with a short timeout, then fall back to the tenant's cloud
//! HTTP API. A cloud 401 triggers exactly one transparent credential
//! refresh and one retry before the failure surfaces.

use crate::error::{CommandError, CommandResult, ProtocolError};
use crate::gen2;
use crate::protocol::{
    adapter_for, CloudCall, CommandRequest, Generation, IndicatorMode, LocalCall,
};
use crate::status::DeviceStatus;
use async_trait::async_trait;
use pluglink_core::config::command as timing;
use pluglink_connect::{SharedCredential, TokenRefresher};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Everything the commander needs to know about one device.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    /// Cloud-side device identifier.
    pub device_id: String,
    pub generation: Generation,
    /// Local IP or host, when the device is reachable on the LAN.
    pub local_addr: Option<String>,
    /// Relay channel, 0 for plugs.
    pub channel: u8,
}

impl DeviceHandle {
    pub fn new(device_id: impl Into<String>, generation: Generation) -> Self {
        Self {
            device_id: device_id.into(),
            generation,
            local_addr: None,
            channel: 0,
        }
    }

    pub fn with_local_addr(mut self, addr: impl Into<String>) -> Self {
        self.local_addr = Some(addr.into());
        self
    }
}

/// Cloud reply with the HTTP status preserved, for the 401 path.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Value,
}

/// HTTP seam between the commander and the network.
///
/// Production uses [`ReqwestGateway`]; tests script replies.
#[async_trait]
pub trait HttpGateway: Send + Sync {
    async fn get_local(&self, url: &str) -> CommandResult<Value>;
    async fn post_local(&self, url: &str, body: &Value) -> CommandResult<Value>;
    async fn post_cloud(&self, url: &str, bearer: &str, body: &Value) -> CommandResult<HttpReply>;
    async fn post_cloud_form(
        &self,
        url: &str,
        bearer: &str,
        form: &[(String, String)],
    ) -> CommandResult<HttpReply>;
}

/// Gateway backed by a shared reqwest client.
pub struct ReqwestGateway {
    client: reqwest::Client,
}

impl ReqwestGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpGateway for ReqwestGateway {
    async fn get_local(&self, url: &str) -> CommandResult<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CommandError::Local(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CommandError::Local(format!("http {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| CommandError::Local(e.to_string()))
    }

    async fn post_local(&self, url: &str, body: &Value) -> CommandResult<Value> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CommandError::Local(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CommandError::Local(format!("http {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| CommandError::Local(e.to_string()))
    }

    async fn post_cloud(&self, url: &str, bearer: &str, body: &Value) -> CommandResult<HttpReply> {
        let response = self
            .client
            .post(url)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(|e| CommandError::Cloud(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok(HttpReply { status, body })
    }

    async fn post_cloud_form(
        &self,
        url: &str,
        bearer: &str,
        form: &[(String, String)],
    ) -> CommandResult<HttpReply> {
        let response = self
            .client
            .post(url)
            .bearer_auth(bearer)
            .form(form)
            .send()
            .await
            .map_err(|e| CommandError::Cloud(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok(HttpReply { status, body })
    }
}

/// Issues commands to devices with the local-then-cloud policy.
pub struct DeviceCommander {
    gateway: Arc<dyn HttpGateway>,
    credential: SharedCredential,
    refresher: Arc<dyn TokenRefresher>,
    rpc_id: AtomicU64,
}

impl DeviceCommander {
    pub fn new(
        gateway: Arc<dyn HttpGateway>,
        credential: SharedCredential,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            gateway,
            credential,
            refresher,
            rpc_id: AtomicU64::new(1),
        }
    }

    /// Turn the relay on or off.
    pub async fn power(
        &self,
        handle: &DeviceHandle,
        on: bool,
        timer_s: Option<u32>,
    ) -> CommandResult<()> {
        let request = adapter_for(handle.generation).set_power(handle.channel, on, timer_s);
        self.execute(handle, request).await?;
        Ok(())
    }

    /// Flip the relay.
    pub async fn toggle(&self, handle: &DeviceHandle) -> CommandResult<()> {
        let request = adapter_for(handle.generation).toggle(handle.channel);
        self.execute(handle, request).await?;
        Ok(())
    }

    /// Fetch and normalize the current status.
    pub async fn status(&self, handle: &DeviceHandle) -> CommandResult<DeviceStatus> {
        let adapter = adapter_for(handle.generation);
        let payload = self.execute(handle, adapter.get_status(handle.channel)).await?;
        Ok(adapter.parse_status(&payload)?)
    }

    /// Zero the energy counter.
    pub async fn reset_counters(&self, handle: &DeviceHandle) -> CommandResult<()> {
        let request = adapter_for(handle.generation).reset_counters(handle.channel)?;
        self.execute(handle, request).await?;
        Ok(())
    }

    /// Configure device-side auto-off.
    pub async fn set_auto_off(
        &self,
        handle: &DeviceHandle,
        enabled: bool,
        delay_s: Option<u32>,
    ) -> CommandResult<()> {
        let request = adapter_for(handle.generation).set_auto_off(handle.channel, enabled, delay_s)?;
        self.execute(handle, request).await?;
        Ok(())
    }

    /// Set the LED indicator. Fails with `Unsupported` below Gen3.
    pub async fn set_indicator(
        &self,
        handle: &DeviceHandle,
        mode: IndicatorMode,
    ) -> CommandResult<()> {
        let request = adapter_for(handle.generation).set_indicator(mode)?;
        self.execute(handle, request).await?;
        Ok(())
    }

    /// Identity, model, and firmware details. RPC generations only.
    pub async fn device_info(&self, handle: &DeviceHandle) -> CommandResult<Value> {
        self.execute(handle, Self::rpc_maintenance(handle, gen2::device_info())?)
            .await
    }

    /// Rename the device.
    pub async fn set_device_name(&self, handle: &DeviceHandle, name: &str) -> CommandResult<()> {
        self.execute(handle, Self::rpc_maintenance(handle, gen2::set_device_name(name))?)
            .await?;
        Ok(())
    }

    /// Current WiFi station settings.
    pub async fn wifi_config(&self, handle: &DeviceHandle) -> CommandResult<Value> {
        self.execute(handle, Self::rpc_maintenance(handle, gen2::wifi_config())?)
            .await
    }

    /// Point the device at a WiFi network.
    pub async fn set_wifi_sta(
        &self,
        handle: &DeviceHandle,
        ssid: &str,
        password: &str,
    ) -> CommandResult<()> {
        self.execute(
            handle,
            Self::rpc_maintenance(handle, gen2::set_wifi_sta(ssid, password))?,
        )
        .await?;
        Ok(())
    }

    /// List the device-side schedule jobs.
    pub async fn schedules(&self, handle: &DeviceHandle) -> CommandResult<Value> {
        self.execute(handle, Self::rpc_maintenance(handle, gen2::schedule_list())?)
            .await
    }

    /// Create a schedule job firing `method` on the cron-style timespec.
    pub async fn create_schedule(
        &self,
        handle: &DeviceHandle,
        timespec: &str,
        method: &str,
        params: Value,
    ) -> CommandResult<Value> {
        self.execute(
            handle,
            Self::rpc_maintenance(handle, gen2::schedule_create(timespec, method, params))?,
        )
        .await
    }

    /// Delete a schedule job by id.
    pub async fn delete_schedule(&self, handle: &DeviceHandle, id: u64) -> CommandResult<()> {
        self.execute(handle, Self::rpc_maintenance(handle, gen2::schedule_delete(id))?)
            .await?;
        Ok(())
    }

    /// Start a firmware update to the given stage.
    pub async fn update_firmware(&self, handle: &DeviceHandle, stage: &str) -> CommandResult<()> {
        self.execute(
            handle,
            Self::rpc_maintenance(handle, gen2::firmware_update(stage))?,
        )
        .await?;
        Ok(())
    }

    fn rpc_maintenance(
        handle: &DeviceHandle,
        request: CommandRequest,
    ) -> CommandResult<CommandRequest> {
        if handle.generation.is_rpc() {
            Ok(request)
        } else {
            Err(CommandError::Protocol(ProtocolError::Unsupported(
                "maintenance rpc on a gen1 device",
            )))
        }
    }

    /// Dispatch one request: local first when an address exists, cloud
    /// otherwise or on local failure.
    async fn execute(&self, handle: &DeviceHandle, request: CommandRequest) -> CommandResult<Value> {
        if let Some(addr) = &handle.local_addr {
            match tokio::time::timeout(timing::LOCAL_TIMEOUT, self.call_local(addr, &request.local))
                .await
            {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    tracing::debug!(
                        device_id = %handle.device_id,
                        error = %e,
                        "local command failed, falling back to cloud"
                    );
                }
                Err(_) => {
                    tracing::debug!(
                        device_id = %handle.device_id,
                        timeout = ?timing::LOCAL_TIMEOUT,
                        "local command timed out, falling back to cloud"
                    );
                }
            }
        }

        match tokio::time::timeout(timing::CLOUD_TIMEOUT, self.call_cloud(handle, &request.cloud))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout(timing::CLOUD_TIMEOUT)),
        }
    }

    async fn call_local(&self, addr: &str, call: &LocalCall) -> CommandResult<Value> {
        match call {
            LocalCall::Get { path } => self.gateway.get_local(&format!("http://{addr}{path}")).await,
            LocalCall::Rpc { method, params } => {
                let body = json!({
                    "id": self.rpc_id.fetch_add(1, Ordering::Relaxed),
                    "method": method,
                    "params": params,
                });
                let reply = self
                    .gateway
                    .post_local(&format!("http://{addr}/rpc"), &body)
                    .await?;
                extract_rpc_result(reply)
            }
        }
    }

    async fn call_cloud(&self, handle: &DeviceHandle, call: &CloudCall) -> CommandResult<Value> {
        let api_host = self.credential.api_host().await;
        let reply = self.post_cloud_with_refresh(handle, call, &api_host).await?;

        if reply.status == 401 {
            return Err(CommandError::Auth(
                "cloud rejected credential after refresh".to_string(),
            ));
        }
        if reply.status >= 400 {
            return Err(CommandError::Cloud(format!("http {}", reply.status)));
        }

        match call {
            CloudCall::Rpc { .. } => extract_rpc_result(reply.body),
            CloudCall::StatusQuery => {
                // The status endpoint nests the payload under data.device_status
                let body = reply.body;
                Ok(body
                    .get("data")
                    .and_then(|d| d.get("device_status"))
                    .cloned()
                    .unwrap_or(body))
            }
            _ => Ok(reply.body),
        }
    }

    /// First cloud attempt, plus at most one refresh-and-retry on a 401.
    async fn post_cloud_with_refresh(
        &self,
        handle: &DeviceHandle,
        call: &CloudCall,
        api_host: &str,
    ) -> CommandResult<HttpReply> {
        let token = self.credential.access_token().await;
        let reply = self.post_cloud_once(handle, call, api_host, &token).await?;
        if reply.status != 401 {
            return Ok(reply);
        }

        tracing::info!(device_id = %handle.device_id, "cloud returned 401, refreshing credential");
        self.credential
            .refresh(self.refresher.as_ref())
            .await
            .map_err(|e| CommandError::Auth(e.to_string()))?;

        let token = self.credential.access_token().await;
        self.post_cloud_once(handle, call, api_host, &token).await
    }

    async fn post_cloud_once(
        &self,
        handle: &DeviceHandle,
        call: &CloudCall,
        api_host: &str,
        token: &str,
    ) -> CommandResult<HttpReply> {
        match call {
            CloudCall::Rpc { method, params } => {
                let url = format!("{api_host}/device/rpc/{}", handle.device_id);
                let body = json!({ "method": method, "params": params });
                self.gateway.post_cloud(&url, token, &body).await
            }
            CloudCall::RelayControl { turn, channel } => {
                let url = format!("{api_host}/device/relay/control");
                let form = vec![
                    ("id".to_string(), handle.device_id.clone()),
                    ("channel".to_string(), channel.to_string()),
                    ("turn".to_string(), turn.to_string()),
                ];
                self.gateway.post_cloud_form(&url, token, &form).await
            }
            CloudCall::StatusQuery => {
                let url = format!("{api_host}/device/status");
                let form = vec![("id".to_string(), handle.device_id.clone())];
                self.gateway.post_cloud_form(&url, token, &form).await
            }
            CloudCall::Unavailable => Err(CommandError::Protocol(ProtocolError::Unsupported(
                "no cloud path for this command",
            ))),
        }
    }
}

/// Unwrap a `{result|error}` RPC body.
fn extract_rpc_result(body: Value) -> CommandResult<Value> {
    if let Some(error) = body.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown rpc error")
            .to_string();
        return Err(CommandError::Rpc { code, message });
    }
    Ok(body.get("result").cloned().unwrap_or(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pluglink_connect::{ConnectResult, Credential, TokenPair};
    use std::sync::Mutex;

    fn credential() -> SharedCredential {
        SharedCredential::new(Credential {
            id: "cred-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            api_host: "https://cloud.example".to_string(),
            access_token: "token-0".to_string(),
            refresh_token: "refresh-0".to_string(),
        })
    }

    struct CountingRefresher {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _host: &str, _refresh: &str) -> ConnectResult<TokenPair> {
            *self.calls.lock().unwrap() += 1;
            Ok(TokenPair {
                access_token: "token-1".to_string(),
                refresh_token: "refresh-1".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct MockGateway {
        local_fails: Mutex<bool>,
        cloud_replies: Mutex<Vec<HttpReply>>,
        local_calls: Mutex<Vec<String>>,
        cloud_calls: Mutex<Vec<(String, String)>>,
    }

    impl MockGateway {
        /// Replies are served in push order.
        fn push_cloud_reply(&self, status: u16, body: Value) {
            self.cloud_replies
                .lock()
                .unwrap()
                .push(HttpReply { status, body });
        }

        fn next_cloud_reply(&self) -> HttpReply {
            let mut replies = self.cloud_replies.lock().unwrap();
            if replies.is_empty() {
                HttpReply {
                    status: 200,
                    body: json!({"result": {}}),
                }
            } else {
                replies.remove(0)
            }
        }
    }

    #[async_trait]
    impl HttpGateway for MockGateway {
        async fn get_local(&self, url: &str) -> CommandResult<Value> {
            self.local_calls.lock().unwrap().push(url.to_string());
            if *self.local_fails.lock().unwrap() {
                return Err(CommandError::Local("connection refused".to_string()));
            }
            Ok(json!({"ison": true}))
        }

        async fn post_local(&self, url: &str, _body: &Value) -> CommandResult<Value> {
            self.local_calls.lock().unwrap().push(url.to_string());
            if *self.local_fails.lock().unwrap() {
                return Err(CommandError::Local("connection refused".to_string()));
            }
            Ok(json!({"id": 1, "result": {"was_on": false}}))
        }

        async fn post_cloud(&self, url: &str, bearer: &str, _body: &Value) -> CommandResult<HttpReply> {
            self.cloud_calls
                .lock()
                .unwrap()
                .push((url.to_string(), bearer.to_string()));
            Ok(self.next_cloud_reply())
        }

        async fn post_cloud_form(
            &self,
            url: &str,
            bearer: &str,
            _form: &[(String, String)],
        ) -> CommandResult<HttpReply> {
            self.cloud_calls
                .lock()
                .unwrap()
                .push((url.to_string(), bearer.to_string()));
            Ok(self.next_cloud_reply())
        }
    }

    fn commander(gateway: Arc<MockGateway>) -> (DeviceCommander, Arc<CountingRefresher>) {
        let refresher = Arc::new(CountingRefresher {
            calls: Mutex::new(0),
        });
        let commander = DeviceCommander::new(gateway, credential(), refresher.clone());
        (commander, refresher)
    }

    #[tokio::test]
    async fn test_local_first_skips_cloud() {
        let gateway = Arc::new(MockGateway::default());
        let (commander, _) = commander(gateway.clone());
        let handle =
            DeviceHandle::new("shelly1-abc", Generation::Gen1).with_local_addr("192.168.1.50");

        commander.power(&handle, true, None).await.unwrap();

        let local = gateway.local_calls.lock().unwrap().clone();
        assert_eq!(local, vec!["http://192.168.1.50/relay/0?turn=on"]);
        assert!(gateway.cloud_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_failure_falls_back_to_cloud() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.local_fails.lock().unwrap() = true;
        let (commander, _) = commander(gateway.clone());
        let handle =
            DeviceHandle::new("plugs3-abc", Generation::Gen3).with_local_addr("192.168.1.50");

        commander.power(&handle, false, None).await.unwrap();

        assert_eq!(gateway.local_calls.lock().unwrap().len(), 1);
        let cloud = gateway.cloud_calls.lock().unwrap().clone();
        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud[0].0, "https://cloud.example/device/rpc/plugs3-abc");
    }

    #[tokio::test]
    async fn test_cloud_401_refreshes_once_and_retries() {
        let gateway = Arc::new(MockGateway::default());
        gateway.push_cloud_reply(401, Value::Null);
        gateway.push_cloud_reply(200, json!({"result": {"was_on": true}}));
        let (commander, refresher) = commander(gateway.clone());
        let handle = DeviceHandle::new("plug2-abc", Generation::Gen2);

        commander.toggle(&handle).await.unwrap();

        assert_eq!(*refresher.calls.lock().unwrap(), 1);
        let cloud = gateway.cloud_calls.lock().unwrap().clone();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud[0].1, "token-0");
        assert_eq!(cloud[1].1, "token-1");
        // The shared credential was updated in place
        assert_eq!(commander.credential.access_token().await, "token-1");
    }

    #[tokio::test]
    async fn test_persistent_401_surfaces_auth_error() {
        let gateway = Arc::new(MockGateway::default());
        gateway.push_cloud_reply(401, Value::Null);
        gateway.push_cloud_reply(401, Value::Null);
        let (commander, refresher) = commander(gateway.clone());
        let handle = DeviceHandle::new("plug2-abc", Generation::Gen2);

        let err = commander.toggle(&handle).await.unwrap_err();
        assert!(matches!(err, CommandError::Auth(_)));
        // Exactly one refresh, never a loop
        assert_eq!(*refresher.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_gen1_reset_has_no_cloud_path() {
        let gateway = Arc::new(MockGateway::default());
        let (commander, _) = commander(gateway.clone());
        let handle = DeviceHandle::new("shelly1-abc", Generation::Gen1);

        let err = commander.reset_counters(&handle).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Protocol(ProtocolError::Unsupported(_))
        ));

        // With a local address the reset goes through
        let handle = handle.with_local_addr("192.168.1.50");
        commander.reset_counters(&handle).await.unwrap();
        assert_eq!(
            gateway.local_calls.lock().unwrap().last().unwrap(),
            "http://192.168.1.50/meter/0?reset=true"
        );
    }

    #[tokio::test]
    async fn test_rpc_error_mapped() {
        let gateway = Arc::new(MockGateway::default());
        gateway.push_cloud_reply(200, json!({"error": {"code": -103, "message": "bad params"}}));
        let (commander, _) = commander(gateway.clone());
        let handle = DeviceHandle::new("plug2-abc", Generation::Gen2);

        let err = commander.toggle(&handle).await.unwrap_err();
        assert!(matches!(err, CommandError::Rpc { code: -103, .. }));
    }

    #[tokio::test]
    async fn test_maintenance_calls_are_generation_gated() {
        let gateway = Arc::new(MockGateway::default());
        let (commander, _) = commander(gateway.clone());

        // Gen1 has no RPC surface at all
        let handle = DeviceHandle::new("shelly1-abc", Generation::Gen1);
        let err = commander.device_info(&handle).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Protocol(ProtocolError::Unsupported(_))
        ));
        assert!(gateway.cloud_calls.lock().unwrap().is_empty());

        // Gen2 routes through the normal rpc dispatch
        let handle = DeviceHandle::new("plug2-abc", Generation::Gen2);
        commander.device_info(&handle).await.unwrap();
        commander
            .set_device_name(&handle, "treatment-room-2")
            .await
            .unwrap();
        commander.update_firmware(&handle, "stable").await.unwrap();

        let cloud = gateway.cloud_calls.lock().unwrap().clone();
        assert_eq!(cloud.len(), 3);
        assert!(cloud
            .iter()
            .all(|(url, _)| url == "https://cloud.example/device/rpc/plug2-abc"));
    }

    #[tokio::test]
    async fn test_indicator_below_gen3_unsupported() {
        let gateway = Arc::new(MockGateway::default());
        let (commander, _) = commander(gateway);
        let handle = DeviceHandle::new("plug2-abc", Generation::Gen2);

        let err = commander
            .set_indicator(&handle, IndicatorMode::Session)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::Protocol(ProtocolError::Unsupported(_))
        ));
    }
}
