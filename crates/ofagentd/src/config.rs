//! Agent configuration file.
//!
//! Loaded from TOML; every field has a default so a missing file or a
//! partial file is valid. [`AgentConfig::validate`] turns the raw file into
//! a [`ValidatedConfig`] the rest of the agent consumes.

use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use ofagent_types::TunnelType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::constants::DEFAULT_VXLAN_UDP_PORT;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ofagent/ofagent.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Switch layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvsConfig {
    #[serde(default = "default_integration_bridge")]
    pub integration_bridge: String,

    #[serde(default = "default_tunnel_bridge")]
    pub tunnel_bridge: String,

    /// Patch port on the integration bridge facing the tunnel bridge
    #[serde(default = "default_int_peer_patch_port")]
    pub int_peer_patch_port: String,

    /// Patch port on the tunnel bridge facing the integration bridge
    #[serde(default = "default_tun_peer_patch_port")]
    pub tun_peer_patch_port: String,

    /// Local tunnel endpoint address
    #[serde(default)]
    pub local_ip: String,

    #[serde(default)]
    pub enable_tunneling: bool,

    /// `physnet:bridge` pairs
    #[serde(default)]
    pub bridge_mappings: Vec<String>,
}

/// Agent behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Rescan only when the switch reports interface changes
    #[serde(default = "default_minimize_polling")]
    pub minimize_polling: bool,

    #[serde(default = "default_ovsdb_monitor_respawn_interval")]
    pub ovsdb_monitor_respawn_interval_secs: u64,

    #[serde(default)]
    pub tunnel_types: Vec<String>,

    #[serde(default = "default_vxlan_udp_port")]
    pub vxlan_udp_port: u16,

    #[serde(default)]
    pub veth_mtu: Option<u32>,

    /// 0 disables the heartbeat
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    #[serde(default = "default_get_datapath_retry_times")]
    pub get_datapath_retry_times: u32,

    #[serde(default = "default_root_helper")]
    pub root_helper: String,
}

/// Control plane endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_plugin_url")]
    pub url: String,

    #[serde(default = "default_plugin_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_notification_poll_interval")]
    pub notification_poll_interval_secs: u64,
}

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub ovs: OvsConfig,

    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub plugin: PluginConfig,
}

fn default_integration_bridge() -> String {
    "br-int".to_string()
}

fn default_tunnel_bridge() -> String {
    "br-tun".to_string()
}

fn default_int_peer_patch_port() -> String {
    "patch-tun".to_string()
}

fn default_tun_peer_patch_port() -> String {
    "patch-int".to_string()
}

fn default_polling_interval() -> u64 {
    2
}

fn default_minimize_polling() -> bool {
    true
}

fn default_ovsdb_monitor_respawn_interval() -> u64 {
    30
}

fn default_vxlan_udp_port() -> u16 {
    DEFAULT_VXLAN_UDP_PORT
}

fn default_report_interval() -> u64 {
    4
}

fn default_get_datapath_retry_times() -> u32 {
    60
}

fn default_root_helper() -> String {
    "sudo".to_string()
}

fn default_plugin_url() -> String {
    "http://127.0.0.1:9696".to_string()
}

fn default_plugin_timeout() -> u64 {
    60
}

fn default_notification_poll_interval() -> u64 {
    1
}

/// Machine hostname, or `localhost` when it cannot be read.
pub fn default_host() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Default for OvsConfig {
    fn default() -> Self {
        Self {
            integration_bridge: default_integration_bridge(),
            tunnel_bridge: default_tunnel_bridge(),
            int_peer_patch_port: default_int_peer_patch_port(),
            tun_peer_patch_port: default_tun_peer_patch_port(),
            local_ip: String::new(),
            enable_tunneling: false,
            bridge_mappings: Vec::new(),
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            polling_interval_secs: default_polling_interval(),
            minimize_polling: default_minimize_polling(),
            ovsdb_monitor_respawn_interval_secs: default_ovsdb_monitor_respawn_interval(),
            tunnel_types: Vec::new(),
            vxlan_udp_port: default_vxlan_udp_port(),
            veth_mtu: None,
            report_interval_secs: default_report_interval(),
            get_datapath_retry_times: default_get_datapath_retry_times(),
            root_helper: default_root_helper(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            url: default_plugin_url(),
            timeout_secs: default_plugin_timeout(),
            notification_poll_interval_secs: default_notification_poll_interval(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ovs: OvsConfig::default(),
            agent: AgentSection::default(),
            plugin: PluginConfig::default(),
        }
    }
}

/// Parses `physnet:bridge` pairs. Physical networks and bridges must both be unique.
pub fn parse_bridge_mappings(mappings: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut parsed = BTreeMap::new();
    for mapping in mappings {
        let mapping = mapping.trim();
        if mapping.is_empty() {
            continue;
        }
        let Some((physnet, bridge)) = mapping.split_once(':') else {
            return Err(ConfigError::invalid(
                "bridge_mappings",
                format!("'{}' is not of the form physnet:bridge", mapping),
            ));
        };
        let (physnet, bridge) = (physnet.trim(), bridge.trim());
        if physnet.is_empty() || bridge.is_empty() {
            return Err(ConfigError::invalid(
                "bridge_mappings",
                format!("'{}' is not of the form physnet:bridge", mapping),
            ));
        }
        if parsed.contains_key(physnet) {
            return Err(ConfigError::invalid(
                "bridge_mappings",
                format!("physical network '{}' mapped twice", physnet),
            ));
        }
        if parsed.values().any(|b| b == bridge) {
            return Err(ConfigError::invalid(
                "bridge_mappings",
                format!("bridge '{}' mapped twice", bridge),
            ));
        }
        parsed.insert(physnet.to_string(), bridge.to_string());
    }
    Ok(parsed)
}

/// Configuration after validation, with typed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub host: String,
    pub integration_bridge: String,
    pub tunnel_bridge: String,
    pub int_peer_patch_port: String,
    pub tun_peer_patch_port: String,
    pub local_ip: String,
    /// Empty when tunneling is disabled.
    pub tunnel_types: Vec<TunnelType>,
    pub bridge_mappings: BTreeMap<String, String>,
    pub polling_interval: Duration,
    pub minimize_polling: bool,
    pub ovsdb_monitor_respawn_interval: Duration,
    pub vxlan_udp_port: u16,
    pub veth_mtu: Option<u32>,
    /// `None` disables the heartbeat.
    pub report_interval: Option<Duration>,
    pub get_datapath_retry_times: u32,
    pub root_helper: String,
    pub plugin_url: String,
    pub plugin_timeout: Duration,
    pub notification_poll_interval: Duration,
}

impl ValidatedConfig {
    pub fn enable_tunneling(&self) -> bool {
        !self.tunnel_types.is_empty()
    }
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let bridge_mappings = parse_bridge_mappings(&self.ovs.bridge_mappings)?;

        let mut tunnel_types = Vec::new();
        for raw in &self.agent.tunnel_types {
            let tunnel_type = raw.parse::<TunnelType>().map_err(|_| {
                ConfigError::invalid(
                    "tunnel_types",
                    format!("Invalid tunnel type specified: {}", raw),
                )
            })?;
            if !tunnel_types.contains(&tunnel_type) {
                tunnel_types.push(tunnel_type);
            }
        }
        if self.ovs.enable_tunneling && tunnel_types.is_empty() {
            tunnel_types.push(TunnelType::Gre);
        }

        if !tunnel_types.is_empty() {
            let local_ip = self.ovs.local_ip.trim();
            if local_ip.is_empty() {
                return Err(ConfigError::invalid(
                    "local_ip",
                    "Tunneling cannot be enabled without a valid local_ip",
                ));
            }
            if local_ip.parse::<IpAddr>().is_err() {
                return Err(ConfigError::invalid(
                    "local_ip",
                    format!("'{}' is not an IP address", local_ip),
                ));
            }
        }

        if self.agent.polling_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "polling_interval_secs",
                "must be > 0",
            ));
        }

        Ok(ValidatedConfig {
            host: self.host.clone(),
            integration_bridge: self.ovs.integration_bridge.clone(),
            tunnel_bridge: self.ovs.tunnel_bridge.clone(),
            int_peer_patch_port: self.ovs.int_peer_patch_port.clone(),
            tun_peer_patch_port: self.ovs.tun_peer_patch_port.clone(),
            local_ip: self.ovs.local_ip.trim().to_string(),
            tunnel_types,
            bridge_mappings,
            polling_interval: Duration::from_secs(self.agent.polling_interval_secs),
            minimize_polling: self.agent.minimize_polling,
            ovsdb_monitor_respawn_interval: Duration::from_secs(
                self.agent.ovsdb_monitor_respawn_interval_secs,
            ),
            vxlan_udp_port: self.agent.vxlan_udp_port,
            veth_mtu: self.agent.veth_mtu,
            report_interval: (self.agent.report_interval_secs > 0)
                .then(|| Duration::from_secs(self.agent.report_interval_secs)),
            get_datapath_retry_times: self.agent.get_datapath_retry_times,
            root_helper: self.agent.root_helper.clone(),
            plugin_url: self.plugin.url.clone(),
            plugin_timeout: Duration::from_secs(self.plugin.timeout_secs),
            notification_poll_interval: Duration::from_secs(
                self.plugin.notification_poll_interval_secs.max(1),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.ovs.integration_bridge, "br-int");
        assert_eq!(config.ovs.tunnel_bridge, "br-tun");
        assert_eq!(config.ovs.int_peer_patch_port, "patch-tun");
        assert_eq!(config.ovs.tun_peer_patch_port, "patch-int");
        assert_eq!(config.agent.polling_interval_secs, 2);
        assert_eq!(config.agent.vxlan_udp_port, 4789);
        assert_eq!(config.agent.get_datapath_retry_times, 60);
        assert_eq!(config.plugin.url, "http://127.0.0.1:9696");

        let validated = config.validate().unwrap();
        assert!(!validated.enable_tunneling());
        assert_eq!(validated.report_interval, Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
host = "compute-7"

[ovs]
local_ip = "192.168.0.10"
enable_tunneling = true
bridge_mappings = ["physnet1:br-eth1"]

[agent]
report_interval_secs = 0
"#
        )
        .unwrap();

        let config = AgentConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.host, "compute-7");
        assert_eq!(config.ovs.integration_bridge, "br-int");

        let validated = config.validate().unwrap();
        assert_eq!(validated.tunnel_types, vec![TunnelType::Gre]);
        assert_eq!(validated.report_interval, None);
        assert_eq!(
            validated.bridge_mappings.get("physnet1").map(String::as_str),
            Some("br-eth1")
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AgentConfig::load_or_default("/nonexistent/ofagent.toml").unwrap();
        assert_eq!(config.ovs.integration_bridge, "br-int");
    }

    #[test]
    fn test_unparseable_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[ovs\nlocal_ip = ").unwrap();
        assert!(matches!(
            AgentConfig::load_or_default(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_bridge_mappings() {
        let parsed =
            parse_bridge_mappings(&strings(&["physnet1:br-eth1", " physnet2 : br-eth2 ", ""]))
                .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["physnet2"], "br-eth2");

        assert!(parse_bridge_mappings(&strings(&["physnet1"])).is_err());
        assert!(parse_bridge_mappings(&strings(&["physnet1:"])).is_err());
        assert!(parse_bridge_mappings(&strings(&["p1:br1", "p1:br2"])).is_err());
        assert!(parse_bridge_mappings(&strings(&["p1:br1", "p2:br1"])).is_err());
    }

    #[test]
    fn test_tunnel_validation() {
        let mut config = AgentConfig::default();
        config.agent.tunnel_types = strings(&["vxlan", "geneve"]);
        config.ovs.local_ip = "10.0.0.1".to_string();
        assert!(config.validate().is_err());

        config.agent.tunnel_types = strings(&["vxlan", "gre", "vxlan"]);
        assert_eq!(
            config.validate().unwrap().tunnel_types,
            vec![TunnelType::Vxlan, TunnelType::Gre]
        );

        config.ovs.local_ip = String::new();
        assert!(config.validate().is_err());
        config.ovs.local_ip = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }
}
