//! Switch handle.
//!
//! [`Bridge`] is the seam between the reconciliation engine and Open
//! vSwitch. [`OvsBridge`] drives a real bridge through `ovs-vsctl` and
//! `ovs-ofctl`; the in-memory double lives in [`crate::sim`].

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use ofagent_common::{shell, AgentError, AgentResult};
use ofagent_types::{MacAddress, OfPort, TunnelType, VifPort};
use serde_json::Value;
use tracing::{debug, warn};

use crate::commands::*;
use crate::flow::FlowMod;

/// Parameters of a tunnel port on the tunnel bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPortSpec {
    pub port_name: String,
    pub remote_ip: String,
    pub local_ip: String,
    pub tunnel_type: TunnelType,
    pub vxlan_udp_port: u16,
}

/// Operations the agent needs from one switch bridge.
#[async_trait]
pub trait Bridge: Send + Sync {
    fn name(&self) -> &str;

    /// Installs or deletes flow entries.
    async fn apply_flow(&self, flow: &FlowMod) -> AgentResult<()>;

    /// Sets the switch-level access tag of a port.
    async fn set_port_tag(&self, port_name: &str, tag: u16) -> AgentResult<()>;

    async fn add_port(&self, port_name: &str) -> AgentResult<OfPort>;

    async fn add_patch_port(&self, local_name: &str, remote_name: &str) -> AgentResult<OfPort>;

    /// Returns [`OfPort::INVALID`] when the switch did not attach the port.
    async fn add_tunnel_port(&self, spec: &TunnelPortSpec) -> AgentResult<OfPort>;

    async fn delete_port(&self, port_name: &str) -> AgentResult<()>;

    /// Deletes and recreates the bridge.
    async fn reset_bridge(&self) -> AgentResult<()>;

    /// Interface ids of the VM ports attached to this bridge.
    async fn vif_port_set(&self) -> AgentResult<BTreeSet<String>>;

    async fn vif_port_by_id(&self, vif_id: &str) -> AgentResult<Option<VifPort>>;

    async fn datapath_id(&self) -> AgentResult<Option<String>>;

    async fn set_protocols(&self, protocols: &str) -> AgentResult<()>;

    /// `external_ids:bridge-id` of the bridge, if set.
    async fn bridge_external_id(&self) -> AgentResult<Option<String>>;

    /// MAC address of the bridge's local port.
    async fn local_port_mac(&self) -> AgentResult<MacAddress>;
}

/// One row of `ovs-vsctl --format=json list Interface`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRow {
    pub name: String,
    pub external_ids: HashMap<String, String>,
    pub ofport: OfPort,
}

impl InterfaceRow {
    pub fn iface_id(&self) -> Option<&str> {
        self.external_ids.get("iface-id").map(String::as_str)
    }

    pub fn to_vif_port(&self, bridge: &str) -> Option<VifPort> {
        let vif_id = self.iface_id()?;
        let mut port = VifPort::new(self.name.clone(), self.ofport, vif_id, bridge);
        if let Some(mac) = self
            .external_ids
            .get("attached-mac")
            .and_then(|m| m.parse::<MacAddress>().ok())
        {
            port = port.with_mac(mac);
        }
        Some(port)
    }
}

/// Parses the ovsdb JSON table format (`{"headings": [...], "data": [[...]]}`)
/// restricted to the `name`, `external_ids` and `ofport` columns.
pub fn parse_interface_rows(output: &str) -> AgentResult<Vec<InterfaceRow>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let table: Value = serde_json::from_str(output)
        .map_err(|e| AgentError::internal(format!("unparseable ovsdb output: {}", e)))?;

    let headings: Vec<&str> = table["headings"]
        .as_array()
        .map(|h| h.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let column = |name: &str| {
        headings
            .iter()
            .position(|h| *h == name)
            .ok_or_else(|| AgentError::internal(format!("ovsdb output lacks column {}", name)))
    };
    let name_idx = column("name")?;
    let ids_idx = column("external_ids")?;
    let ofport_idx = column("ofport")?;

    let mut rows = Vec::new();
    for row in table["data"].as_array().into_iter().flatten() {
        let Some(name) = row[name_idx].as_str() else {
            continue;
        };
        rows.push(InterfaceRow {
            name: name.to_string(),
            external_ids: parse_ovsdb_map(&row[ids_idx]),
            ofport: parse_ovsdb_ofport(&row[ofport_idx]),
        });
    }
    Ok(rows)
}

/// `["map", [[k, v], ...]]`
fn parse_ovsdb_map(value: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if value[0].as_str() != Some("map") {
        return map;
    }
    for pair in value[1].as_array().into_iter().flatten() {
        if let (Some(k), Some(v)) = (pair[0].as_str(), pair[1].as_str()) {
            map.insert(k.to_string(), v.to_string());
        }
    }
    map
}

/// A bare integer, or `["set", []]` while unassigned.
fn parse_ovsdb_ofport(value: &Value) -> OfPort {
    value
        .as_i64()
        .and_then(|n| i32::try_from(n).ok())
        .map(OfPort::new)
        .unwrap_or(OfPort::INVALID)
}

/// Strips the quoting ovs-vsctl puts around string columns.
fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// An Open vSwitch bridge driven through the command line tools.
pub struct OvsBridge {
    name: String,
    root_helper: String,

    /// Mock mode for testing
    #[cfg(test)]
    mock_mode: bool,

    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: parking_lot::Mutex<Vec<String>>,

    /// Canned outputs returned in order in mock mode
    #[cfg(test)]
    mock_outputs: parking_lot::Mutex<std::collections::VecDeque<String>>,
}

impl OvsBridge {
    pub fn new(name: impl Into<String>, root_helper: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root_helper: root_helper.into(),
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: parking_lot::Mutex::new(Vec::new()),
            #[cfg(test)]
            mock_outputs: parking_lot::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    #[cfg(test)]
    pub fn new_mock(name: &str) -> Self {
        let mut br = Self::new(name, "sudo");
        br.mock_mode = true;
        br
    }

    #[cfg(test)]
    pub fn push_output(&self, output: &str) {
        self.mock_outputs.lock().push_back(output.to_string());
    }

    #[cfg(test)]
    pub fn get_captured_commands(&self) -> Vec<String> {
        self.captured_commands.lock().clone()
    }

    /// Execute shell command (or capture in mock mode)
    async fn exec(&self, cmd: &str) -> AgentResult<String> {
        let cmd = shell::as_root(&self.root_helper, cmd);

        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().push(cmd);
            return Ok(self.mock_outputs.lock().pop_front().unwrap_or_default());
        }

        shell::exec_or_throw(&cmd).await
    }

    async fn ofport(&self, port_name: &str) -> OfPort {
        match self.exec(&build_get_ofport_cmd(port_name)).await {
            Ok(out) => out.parse().unwrap_or_else(|e| {
                warn!("Unparseable ofport for {}: {}", port_name, e);
                OfPort::INVALID
            }),
            Err(e) => {
                warn!("Unable to read ofport of {}: {}", port_name, e);
                OfPort::INVALID
            }
        }
    }

    async fn port_names(&self) -> AgentResult<BTreeSet<String>> {
        let out = self.exec(&build_list_ports_cmd(&self.name)).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Bridge for OvsBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_flow(&self, flow: &FlowMod) -> AgentResult<()> {
        debug!(bridge = %self.name, flow = %flow, "Applying flow");
        self.exec(&build_flow_cmd(&self.name, flow)).await?;
        Ok(())
    }

    async fn set_port_tag(&self, port_name: &str, tag: u16) -> AgentResult<()> {
        self.exec(&build_set_port_tag_cmd(port_name, tag)).await?;
        Ok(())
    }

    async fn add_port(&self, port_name: &str) -> AgentResult<OfPort> {
        self.exec(&build_add_port_cmd(&self.name, port_name)).await?;
        Ok(self.ofport(port_name).await)
    }

    async fn add_patch_port(&self, local_name: &str, remote_name: &str) -> AgentResult<OfPort> {
        self.exec(&build_add_patch_port_cmd(&self.name, local_name, remote_name))
            .await?;
        Ok(self.ofport(local_name).await)
    }

    async fn add_tunnel_port(&self, spec: &TunnelPortSpec) -> AgentResult<OfPort> {
        self.exec(&build_add_tunnel_port_cmd(&self.name, spec)).await?;
        Ok(self.ofport(&spec.port_name).await)
    }

    async fn delete_port(&self, port_name: &str) -> AgentResult<()> {
        self.exec(&build_del_port_cmd(&self.name, port_name)).await?;
        Ok(())
    }

    async fn reset_bridge(&self) -> AgentResult<()> {
        self.exec(&build_reset_bridge_cmd(&self.name)).await?;
        Ok(())
    }

    async fn vif_port_set(&self) -> AgentResult<BTreeSet<String>> {
        let ports = self.port_names().await?;
        let rows = parse_interface_rows(&self.exec(&build_list_interfaces_cmd()).await?)?;

        let mut vifs = BTreeSet::new();
        for row in rows.iter().filter(|r| ports.contains(&r.name)) {
            let Some(vif_id) = row.iface_id() else {
                continue;
            };
            if !row.ofport.is_valid() {
                warn!("Found not yet ready openvswitch port: {}", row.name);
                continue;
            }
            vifs.insert(vif_id.to_string());
        }
        Ok(vifs)
    }

    async fn vif_port_by_id(&self, vif_id: &str) -> AgentResult<Option<VifPort>> {
        let rows = parse_interface_rows(
            &self
                .exec(&build_find_interface_by_iface_id_cmd(vif_id))
                .await?,
        )?;
        if rows.is_empty() {
            return Ok(None);
        }
        let ports = self.port_names().await?;
        Ok(rows
            .iter()
            .filter(|r| ports.contains(&r.name))
            .find_map(|r| r.to_vif_port(&self.name)))
    }

    async fn datapath_id(&self) -> AgentResult<Option<String>> {
        let out = self.exec(&build_get_datapath_id_cmd(&self.name)).await?;
        let id = unquote(&out);
        if id.is_empty() || id == "[]" {
            Ok(None)
        } else {
            Ok(Some(id.to_string()))
        }
    }

    async fn set_protocols(&self, protocols: &str) -> AgentResult<()> {
        self.exec(&build_set_protocols_cmd(&self.name, protocols))
            .await?;
        Ok(())
    }

    async fn bridge_external_id(&self) -> AgentResult<Option<String>> {
        let out = self.exec(&build_get_bridge_id_cmd(&self.name)).await?;
        let id = unquote(&out);
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    async fn local_port_mac(&self) -> AgentResult<MacAddress> {
        let out = self.exec(&build_get_mac_in_use_cmd(&self.name)).await?;
        out.parse::<MacAddress>().map_err(|e| {
            AgentError::internal(format!("bridge {} local port MAC: {}", self.name, e))
        })
    }
}

/// Names of all bridges known to the switch.
pub async fn list_bridges(root_helper: &str) -> AgentResult<Vec<String>> {
    let out = shell::exec_or_throw(&shell::as_root(root_helper, &build_list_bridges_cmd())).await?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
