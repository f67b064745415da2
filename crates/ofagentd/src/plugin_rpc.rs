//! Control-plane client.
//!
//! [`PluginApi`] is what the reconciliation engine consumes; the HTTP/JSON
//! transport in [`HttpPluginClient`] is one implementation of it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ofagent_common::{AgentError, AgentResult};
use ofagent_types::{NetworkType, TunnelType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::binding::PortBinding;
use crate::notifications::AgentNotification;

/// Reply to `get_device_details`.
///
/// The plugin answers with only `device` set when it does not know the
/// port; everything else is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<NetworkType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation_id: Option<u32>,
    #[serde(default)]
    pub admin_state_up: bool,
}

impl DeviceDetails {
    /// Details for a device the plugin does not know.
    pub fn unknown(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    /// Port binding, or `None` when the port is not defined on the plugin.
    pub fn binding(&self) -> Option<PortBinding> {
        Some(PortBinding {
            port_id: self.port_id.clone()?,
            network_id: self.network_id.clone()?,
            network_type: self.network_type.clone()?,
            physical_network: self.physical_network.clone(),
            segmentation_id: self.segmentation_id,
            admin_state_up: self.admin_state_up,
        })
    }
}

/// Reply to `update_device_down`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDownReply {
    pub device: String,
    #[serde(default)]
    pub exists: bool,
}

/// Tunnel endpoint identifier; the plugin sends either a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TunnelId {
    Number(u64),
    Name(String),
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelId::Number(n) => write!(f, "{}", n),
            TunnelId::Name(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TunnelId>,
}

impl TunnelEndpoint {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: TunnelId) -> Self {
        self.id = Some(id);
        self
    }

    /// Identity used in the tunnel port name; falls back to the address.
    pub fn port_suffix(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.ip_address.clone())
    }
}

/// Reply to `tunnel_sync`: every known peer of one tunnel type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSyncReply {
    #[serde(default)]
    pub tunnels: Vec<TunnelEndpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigurations {
    pub bridge_mappings: BTreeMap<String, String>,
    pub tunnel_types: Vec<TunnelType>,
    pub tunneling_ip: String,
    pub l2_population: bool,
    pub devices: usize,
}

/// Heartbeat payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStateReport {
    pub binary: String,
    pub host: String,
    pub topic: String,
    pub agent_type: String,
    pub configurations: AgentConfigurations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_flag: Option<bool>,
}

/// Calls the agent makes on the control plane.
#[async_trait]
pub trait PluginApi: Send + Sync {
    async fn get_device_details(&self, device: &str, agent_id: &str) -> AgentResult<DeviceDetails>;

    async fn update_device_up(&self, device: &str, agent_id: &str, host: &str) -> AgentResult<()>;

    async fn update_device_down(
        &self,
        device: &str,
        agent_id: &str,
        host: &str,
    ) -> AgentResult<DeviceDownReply>;

    async fn tunnel_sync(
        &self,
        local_ip: &str,
        tunnel_type: TunnelType,
    ) -> AgentResult<TunnelSyncReply>;

    async fn report_state(&self, report: &AgentStateReport) -> AgentResult<()>;
}

#[derive(Serialize)]
struct DeviceRequest<'a> {
    device: &'a str,
    agent_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
}

#[derive(Serialize)]
struct TunnelSyncRequest<'a> {
    tunnel_ip: &'a str,
    tunnel_type: TunnelType,
}

#[derive(Serialize)]
struct NotificationRequest<'a> {
    agent_id: &'a str,
    host: &'a str,
}

/// JSON over HTTP control-plane transport.
///
/// Every call is a `POST {base}/v1/agent/{operation}` with a per-request
/// timeout; a timeout maps to [`AgentError::RpcTimeout`].
pub struct HttpPluginClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPluginClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::invalid_config("plugin.url", e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, operation: &str) -> String {
        format!("{}/v1/agent/{}", self.base_url, operation)
    }

    async fn call<B, R>(&self, operation: &str, body: &B) -> AgentResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        debug!(operation, "Plugin RPC");
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                AgentError::rpc_timeout(operation)
            } else {
                AgentError::rpc(operation, e.to_string())
            }
        };
        let response = self
            .client
            .post(self.endpoint(operation))
            .json(body)
            .send()
            .await
            .map_err(map_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::rpc(operation, format!("HTTP {}", status)));
        }
        response.json::<R>().await.map_err(map_err)
    }

    /// Drains pending notifications queued for this agent.
    pub async fn fetch_notifications(
        &self,
        agent_id: &str,
        host: &str,
    ) -> AgentResult<Vec<AgentNotification>> {
        self.call("notifications", &NotificationRequest { agent_id, host })
            .await
    }
}

#[async_trait]
impl PluginApi for HttpPluginClient {
    async fn get_device_details(&self, device: &str, agent_id: &str) -> AgentResult<DeviceDetails> {
        self.call(
            "get_device_details",
            &DeviceRequest {
                device,
                agent_id,
                host: None,
            },
        )
        .await
    }

    async fn update_device_up(&self, device: &str, agent_id: &str, host: &str) -> AgentResult<()> {
        let _: serde_json::Value = self
            .call(
                "update_device_up",
                &DeviceRequest {
                    device,
                    agent_id,
                    host: Some(host),
                },
            )
            .await?;
        Ok(())
    }

    async fn update_device_down(
        &self,
        device: &str,
        agent_id: &str,
        host: &str,
    ) -> AgentResult<DeviceDownReply> {
        self.call(
            "update_device_down",
            &DeviceRequest {
                device,
                agent_id,
                host: Some(host),
            },
        )
        .await
    }

    async fn tunnel_sync(
        &self,
        local_ip: &str,
        tunnel_type: TunnelType,
    ) -> AgentResult<TunnelSyncReply> {
        self.call(
            "tunnel_sync",
            &TunnelSyncRequest {
                tunnel_ip: local_ip,
                tunnel_type,
            },
        )
        .await
    }

    async fn report_state(&self, report: &AgentStateReport) -> AgentResult<()> {
        let _: serde_json::Value = self.call("report_state", report).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_device_details_binding() {
        let details: DeviceDetails = serde_json::from_str(
            r#"{"device":"p1","port_id":"p1","network_id":"net-a","network_type":"vlan",
                "physical_network":"physnet1","segmentation_id":100,"admin_state_up":true}"#,
        )
        .unwrap();
        let binding = details.binding().unwrap();
        assert_eq!(binding.network_type, NetworkType::Vlan);
        assert_eq!(binding.segmentation_id, Some(100));
        assert!(binding.admin_state_up);
    }

    #[test]
    fn test_unknown_device_has_no_binding() {
        let details: DeviceDetails = serde_json::from_str(r#"{"device":"p2"}"#).unwrap();
        assert_eq!(details, DeviceDetails::unknown("p2"));
        assert!(details.binding().is_none());
    }

    #[test]
    fn test_tunnel_endpoint_ids() {
        let reply: TunnelSyncReply = serde_json::from_str(
            r#"{"tunnels":[{"ip_address":"10.0.0.2","id":7},{"ip_address":"10.0.0.3","id":"peer"},{"ip_address":"10.0.0.4"}]}"#,
        )
        .unwrap();
        let suffixes: Vec<String> = reply.tunnels.iter().map(|t| t.port_suffix()).collect();
        assert_eq!(suffixes, vec!["7", "peer", "10.0.0.4"]);
    }

    #[test]
    fn test_state_report_omits_cleared_start_flag() {
        let mut report = AgentStateReport {
            binary: "ofagentd".to_string(),
            host: "compute-1".to_string(),
            start_flag: Some(true),
            ..Default::default()
        };
        assert!(serde_json::to_string(&report).unwrap().contains("start_flag"));
        report.start_flag = None;
        assert!(!serde_json::to_string(&report).unwrap().contains("start_flag"));
    }

    #[test]
    fn test_endpoint() {
        let client = HttpPluginClient::new("http://127.0.0.1:9696/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint("tunnel_sync"),
            "http://127.0.0.1:9696/v1/agent/tunnel_sync"
        );
    }
}
