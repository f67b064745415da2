//! In-memory doubles for the switch, the control plane, the firewall and
//! host links.
//!
//! They keep the state a real backend would (flow tables, port tags,
//! reported device states) so that reconciliation can be exercised end to
//! end without Open vSwitch or a plugin server.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use ofagent_common::{AgentError, AgentResult};
use ofagent_types::{MacAddress, OfPort, TunnelType, VifPort};
use parking_lot::Mutex;

use crate::bridge::{Bridge, TunnelPortSpec};
use crate::bridge_setup::HostLinks;
use crate::flow::{FlowCommand, FlowMod, TableId};
use crate::plugin_rpc::{
    AgentStateReport, DeviceDetails, DeviceDownReply, PluginApi, TunnelEndpoint, TunnelSyncReply,
};
use crate::security_group::SecurityGroupGate;

/// A port on a [`SimBridge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimPort {
    pub ofport: OfPort,
    pub tag: Option<u16>,
    /// Interface id for VM ports.
    pub vif_id: Option<String>,
    pub tunnel: Option<TunnelPortSpec>,
    pub patch_peer: Option<String>,
}

#[derive(Debug, Default)]
struct SimBridgeState {
    flows: Vec<FlowMod>,
    applied: Vec<FlowMod>,
    ports: BTreeMap<String, SimPort>,
    next_ofport: i32,
    datapath_id: Option<String>,
    /// Datapath id lookups left before the datapath shows up.
    datapath_delay: u32,
    protocols: Option<String>,
    external_id: Option<String>,
    mac: MacAddress,
    fail_tunnel_ports: bool,
    fail_patch_ports: bool,
    fail_flows: bool,
    resets: u32,
}

/// A bridge that keeps its flow table and ports in memory.
///
/// An add replaces any entry with the same table, priority and match; a
/// delete removes every entry it covers, as a non-strict OpenFlow delete does.
#[derive(Debug)]
pub struct SimBridge {
    name: String,
    state: Mutex<SimBridgeState>,
}

impl SimBridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimBridgeState {
                next_ofport: 1,
                datapath_id: Some("0000000000000001".to_string()),
                mac: MacAddress::new([0x02, 0, 0, 0, 0, 0x01]),
                ..Default::default()
            }),
        }
    }

    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    fn next_ofport(state: &mut SimBridgeState) -> OfPort {
        let ofport = OfPort::new(state.next_ofport);
        state.next_ofport += 1;
        ofport
    }

    /// Attaches a VM port with the given interface id.
    pub fn add_vif(&self, port_name: &str, vif_id: &str, ofport: i32) -> VifPort {
        let mut state = self.state.lock();
        state.next_ofport = state.next_ofport.max(ofport + 1);
        state.ports.insert(
            port_name.to_string(),
            SimPort {
                ofport: OfPort::new(ofport),
                tag: None,
                vif_id: Some(vif_id.to_string()),
                tunnel: None,
                patch_peer: None,
            },
        );
        VifPort::new(port_name, OfPort::new(ofport), vif_id, self.name.clone())
    }

    /// Detaches a VM port by interface id.
    pub fn remove_vif(&self, vif_id: &str) {
        self.state
            .lock()
            .ports
            .retain(|_, p| p.vif_id.as_deref() != Some(vif_id));
    }

    /// Installed flow entries in insertion order.
    pub fn flows(&self) -> Vec<FlowMod> {
        self.state.lock().flows.clone()
    }

    pub fn flows_in_table(&self, table: u8) -> Vec<FlowMod> {
        self.state
            .lock()
            .flows
            .iter()
            .filter(|f| f.table() == TableId::Id(table))
            .cloned()
            .collect()
    }

    pub fn find_flow(&self, predicate: impl Fn(&FlowMod) -> bool) -> Option<FlowMod> {
        self.state.lock().flows.iter().find(|f| predicate(f)).cloned()
    }

    /// Every modification received, adds and deletes alike.
    pub fn applied(&self) -> Vec<FlowMod> {
        self.state.lock().applied.clone()
    }

    pub fn port_tag(&self, port_name: &str) -> Option<u16> {
        self.state.lock().ports.get(port_name).and_then(|p| p.tag)
    }

    pub fn port(&self, port_name: &str) -> Option<SimPort> {
        self.state.lock().ports.get(port_name).cloned()
    }

    pub fn port_names(&self) -> Vec<String> {
        self.state.lock().ports.keys().cloned().collect()
    }

    pub fn protocols(&self) -> Option<String> {
        self.state.lock().protocols.clone()
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().resets
    }

    pub fn set_fail_tunnel_ports(&self, fail: bool) {
        self.state.lock().fail_tunnel_ports = fail;
    }

    pub fn set_fail_patch_ports(&self, fail: bool) {
        self.state.lock().fail_patch_ports = fail;
    }

    pub fn set_fail_flows(&self, fail: bool) {
        self.state.lock().fail_flows = fail;
    }

    /// Datapath id becomes visible after `lookups` queries; `None` hides it for good.
    pub fn set_datapath_after(&self, lookups: Option<u32>) {
        let mut state = self.state.lock();
        match lookups {
            Some(n) => {
                state.datapath_delay = n;
                state.datapath_id = Some("0000000000000001".to_string());
            }
            None => state.datapath_id = None,
        }
    }

    pub fn set_external_id(&self, id: Option<&str>) {
        self.state.lock().external_id = id.map(str::to_string);
    }
}

#[async_trait]
impl Bridge for SimBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_flow(&self, flow: &FlowMod) -> AgentResult<()> {
        let mut state = self.state.lock();
        if state.fail_flows {
            return Err(AgentError::ShellCommandFailed {
                command: format!("ovs-ofctl {}", flow),
                exit_code: 1,
                output: "simulated failure".to_string(),
            });
        }
        state.applied.push(flow.clone());
        match flow.command() {
            FlowCommand::Add => {
                state.flows.retain(|f| !f.same_key(flow));
                state.flows.push(flow.clone());
            }
            FlowCommand::Delete => state.flows.retain(|f| !flow.deletes(f)),
        }
        Ok(())
    }

    async fn set_port_tag(&self, port_name: &str, tag: u16) -> AgentResult<()> {
        let mut state = self.state.lock();
        let port = state
            .ports
            .get_mut(port_name)
            .ok_or_else(|| AgentError::port_not_found(self.name.as_str(), port_name))?;
        port.tag = Some(tag);
        Ok(())
    }

    async fn add_port(&self, port_name: &str) -> AgentResult<OfPort> {
        let mut state = self.state.lock();
        if let Some(existing) = state.ports.get(port_name) {
            return Ok(existing.ofport);
        }
        let ofport = Self::next_ofport(&mut state);
        state.ports.insert(
            port_name.to_string(),
            SimPort {
                ofport,
                tag: None,
                vif_id: None,
                tunnel: None,
                patch_peer: None,
            },
        );
        Ok(ofport)
    }

    async fn add_patch_port(&self, local_name: &str, remote_name: &str) -> AgentResult<OfPort> {
        let mut state = self.state.lock();
        if state.fail_patch_ports {
            return Ok(OfPort::INVALID);
        }
        let ofport = Self::next_ofport(&mut state);
        state.ports.insert(
            local_name.to_string(),
            SimPort {
                ofport,
                tag: None,
                vif_id: None,
                tunnel: None,
                patch_peer: Some(remote_name.to_string()),
            },
        );
        Ok(ofport)
    }

    async fn add_tunnel_port(&self, spec: &TunnelPortSpec) -> AgentResult<OfPort> {
        let mut state = self.state.lock();
        if state.fail_tunnel_ports {
            return Ok(OfPort::INVALID);
        }
        if let Some(existing) = state.ports.get(&spec.port_name) {
            return Ok(existing.ofport);
        }
        let ofport = Self::next_ofport(&mut state);
        state.ports.insert(
            spec.port_name.clone(),
            SimPort {
                ofport,
                tag: None,
                vif_id: None,
                tunnel: Some(spec.clone()),
                patch_peer: None,
            },
        );
        Ok(ofport)
    }

    async fn delete_port(&self, port_name: &str) -> AgentResult<()> {
        self.state.lock().ports.remove(port_name);
        Ok(())
    }

    async fn reset_bridge(&self) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.flows.clear();
        state.ports.clear();
        state.resets += 1;
        Ok(())
    }

    async fn vif_port_set(&self) -> AgentResult<BTreeSet<String>> {
        Ok(self
            .state
            .lock()
            .ports
            .values()
            .filter(|p| p.ofport.is_valid())
            .filter_map(|p| p.vif_id.clone())
            .collect())
    }

    async fn vif_port_by_id(&self, vif_id: &str) -> AgentResult<Option<VifPort>> {
        Ok(self
            .state
            .lock()
            .ports
            .iter()
            .find(|(_, p)| p.vif_id.as_deref() == Some(vif_id))
            .map(|(name, p)| VifPort::new(name.clone(), p.ofport, vif_id, self.name.clone())))
    }

    async fn datapath_id(&self) -> AgentResult<Option<String>> {
        let mut state = self.state.lock();
        if state.datapath_delay > 0 {
            state.datapath_delay -= 1;
            return Ok(None);
        }
        Ok(state.datapath_id.clone())
    }

    async fn set_protocols(&self, protocols: &str) -> AgentResult<()> {
        self.state.lock().protocols = Some(protocols.to_string());
        Ok(())
    }

    async fn bridge_external_id(&self) -> AgentResult<Option<String>> {
        Ok(self.state.lock().external_id.clone())
    }

    async fn local_port_mac(&self) -> AgentResult<MacAddress> {
        Ok(self.state.lock().mac)
    }
}

#[derive(Debug, Default)]
struct SimPluginState {
    details: HashMap<String, DeviceDetails>,
    failing_devices: HashSet<String>,
    tunnels: HashMap<TunnelType, Vec<TunnelEndpoint>>,
    fail_tunnel_sync: bool,
    fail_reports: bool,
    fail_device_down: bool,
    up_timeouts: bool,

    devices_up: Vec<String>,
    devices_down: Vec<String>,
    reports: Vec<AgentStateReport>,
    tunnel_sync_calls: Vec<(String, TunnelType)>,
}

/// Control plane answering from a table of known ports and peers.
#[derive(Debug, Default)]
pub struct SimPluginClient {
    state: Mutex<SimPluginState>,
}

impl SimPluginClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_details(&self, details: DeviceDetails) {
        self.state
            .lock()
            .details
            .insert(details.device.clone(), details);
    }

    pub fn remove_details(&self, device: &str) {
        self.state.lock().details.remove(device);
    }

    /// Makes `get_device_details` fail for `device`.
    pub fn fail_device(&self, device: &str) {
        self.state.lock().failing_devices.insert(device.to_string());
    }

    pub fn set_tunnels(&self, tunnel_type: TunnelType, tunnels: Vec<TunnelEndpoint>) {
        self.state.lock().tunnels.insert(tunnel_type, tunnels);
    }

    pub fn set_fail_tunnel_sync(&self, fail: bool) {
        self.state.lock().fail_tunnel_sync = fail;
    }

    pub fn set_fail_reports(&self, fail: bool) {
        self.state.lock().fail_reports = fail;
    }

    pub fn set_fail_device_down(&self, fail: bool) {
        self.state.lock().fail_device_down = fail;
    }

    pub fn set_up_timeouts(&self, timeout: bool) {
        self.state.lock().up_timeouts = timeout;
    }

    pub fn devices_up(&self) -> Vec<String> {
        self.state.lock().devices_up.clone()
    }

    pub fn devices_down(&self) -> Vec<String> {
        self.state.lock().devices_down.clone()
    }

    pub fn reports(&self) -> Vec<AgentStateReport> {
        self.state.lock().reports.clone()
    }

    pub fn tunnel_sync_calls(&self) -> Vec<(String, TunnelType)> {
        self.state.lock().tunnel_sync_calls.clone()
    }
}

#[async_trait]
impl PluginApi for SimPluginClient {
    async fn get_device_details(&self, device: &str, _agent_id: &str) -> AgentResult<DeviceDetails> {
        let state = self.state.lock();
        if state.failing_devices.contains(device) {
            return Err(AgentError::rpc("get_device_details", format!("{} unavailable", device)));
        }
        Ok(state
            .details
            .get(device)
            .cloned()
            .unwrap_or_else(|| DeviceDetails::unknown(device)))
    }

    async fn update_device_up(&self, device: &str, _agent_id: &str, _host: &str) -> AgentResult<()> {
        let mut state = self.state.lock();
        if state.up_timeouts {
            return Err(AgentError::rpc_timeout("update_device_up"));
        }
        state.devices_up.push(device.to_string());
        Ok(())
    }

    async fn update_device_down(
        &self,
        device: &str,
        _agent_id: &str,
        _host: &str,
    ) -> AgentResult<DeviceDownReply> {
        let mut state = self.state.lock();
        if state.fail_device_down {
            return Err(AgentError::rpc("update_device_down", "simulated failure"));
        }
        state.devices_down.push(device.to_string());
        Ok(DeviceDownReply {
            device: device.to_string(),
            exists: state.details.contains_key(device),
        })
    }

    async fn tunnel_sync(
        &self,
        local_ip: &str,
        tunnel_type: TunnelType,
    ) -> AgentResult<TunnelSyncReply> {
        let mut state = self.state.lock();
        state
            .tunnel_sync_calls
            .push((local_ip.to_string(), tunnel_type));
        if state.fail_tunnel_sync {
            return Err(AgentError::rpc("tunnel_sync", "simulated failure"));
        }
        Ok(TunnelSyncReply {
            tunnels: state.tunnels.get(&tunnel_type).cloned().unwrap_or_default(),
        })
    }

    async fn report_state(&self, report: &AgentStateReport) -> AgentResult<()> {
        let mut state = self.state.lock();
        if state.fail_reports {
            return Err(AgentError::rpc("report_state", "simulated failure"));
        }
        state.reports.push(report.clone());
        Ok(())
    }
}

/// Firewall gate that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingFirewall {
    prepared: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    refreshes: Mutex<u32>,
}

impl RecordingFirewall {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn prepared(&self) -> Vec<String> {
        self.prepared.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn refreshes(&self) -> u32 {
        *self.refreshes.lock()
    }
}

#[async_trait]
impl SecurityGroupGate for RecordingFirewall {
    async fn prepare_devices_filter(&self, devices: &[String]) {
        self.prepared.lock().extend_from_slice(devices);
    }

    async fn remove_devices_filter(&self, devices: &[String]) {
        self.removed.lock().extend_from_slice(devices);
    }

    async fn refresh_firewall(&self) {
        *self.refreshes.lock() += 1;
    }
}

/// Host link table kept in memory.
#[derive(Debug, Default)]
pub struct SimLinks {
    devices: Mutex<BTreeSet<String>>,
    ops: Mutex<Vec<String>>,
}

impl SimLinks {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_device(&self, name: &str) {
        self.devices.lock().insert(name.to_string());
    }

    pub fn devices(&self) -> Vec<String> {
        self.devices.lock().iter().cloned().collect()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl HostLinks for SimLinks {
    async fn device_exists(&self, name: &str) -> bool {
        self.devices.lock().contains(name)
    }

    async fn delete_link(&self, name: &str) -> AgentResult<()> {
        self.ops.lock().push(format!("del {}", name));
        self.devices.lock().remove(name);
        Ok(())
    }

    async fn udev_settle(&self) -> AgentResult<()> {
        self.ops.lock().push("settle".to_string());
        Ok(())
    }

    async fn add_veth(&self, name: &str, peer: &str) -> AgentResult<()> {
        self.ops.lock().push(format!("veth {} {}", name, peer));
        let mut devices = self.devices.lock();
        devices.insert(name.to_string());
        devices.insert(peer.to_string());
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> AgentResult<()> {
        self.ops.lock().push(format!("up {}", name));
        Ok(())
    }

    async fn set_link_mtu(&self, name: &str, mtu: u32) -> AgentResult<()> {
        self.ops.lock().push(format!("mtu {} {}", name, mtu));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowMatch;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_sim_bridge_flow_table_semantics() {
        let br = SimBridge::new("br-int");
        let add = |prio: u16, port: i32| {
            FlowMod::add(0)
                .priority(prio)
                .matching(FlowMatch::new().with_in_port(OfPort::new(port)))
                .build()
                .unwrap()
        };
        br.apply_flow(&add(2, 5)).await.unwrap();
        br.apply_flow(&add(2, 5)).await.unwrap();
        br.apply_flow(&add(3, 5)).await.unwrap();
        br.apply_flow(&add(2, 6)).await.unwrap();
        assert_eq!(br.flows().len(), 3);

        let del = FlowMod::delete(TableId::All)
            .matching(FlowMatch::new().with_in_port(OfPort::new(5)))
            .build()
            .unwrap();
        br.apply_flow(&del).await.unwrap();
        assert_eq!(br.flows(), vec![add(2, 6)]);
        assert_eq!(br.applied().len(), 5);
    }

    #[tokio::test]
    async fn test_sim_bridge_unknown_port_tag() {
        let br = SimBridge::new("br-int");
        assert!(br.set_port_tag("tap9", 1).await.is_err());
        br.add_vif("tap1", "port-1", 4);
        br.set_port_tag("tap1", 7).await.unwrap();
        assert_eq!(br.port_tag("tap1"), Some(7));
        assert_eq!(
            br.vif_port_set().await.unwrap(),
            BTreeSet::from(["port-1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_sim_plugin_device_down_exists() {
        let plugin = SimPluginClient::new();
        plugin.set_details(DeviceDetails::unknown("p1"));
        assert!(plugin.update_device_down("p1", "a", "h").await.unwrap().exists);
        assert!(!plugin.update_device_down("p2", "a", "h").await.unwrap().exists);
        assert_eq!(plugin.devices_down(), vec!["p1", "p2"]);
    }
}
