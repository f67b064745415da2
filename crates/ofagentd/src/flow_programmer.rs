//! Renders network bindings into flow-table mutations.
//!
//! [`FlowProgrammer`] owns every piece of mutable reconciliation state: the
//! tag pool, the per-network bindings and the tunnel port inventory. It is
//! shared behind a single `tokio::sync::Mutex` so that the reconciliation
//! loop and inbound notifications never interleave their mutations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ofagent_common::AgentResult;
use ofagent_types::{NetworkType, OfPort, TunnelType, VifPort, DEAD_VLAN_TAG};
use tracing::{debug, error, info, instrument, warn};

use crate::binding::{NetworkBinding, PortBinding};
use crate::bridge::{Bridge, TunnelPortSpec};
use crate::constants::*;
use crate::flow::{Action, FlowMatch, FlowMod, PortNo, TableId};
use crate::tag_allocator::TagAllocator;

/// A physical bridge and the two ends of its veth pair to the integration bridge.
#[derive(Clone)]
pub struct PhysicalBridge {
    pub bridge: Arc<dyn Bridge>,
    /// `int-<bridge>` port number on the integration bridge.
    pub int_ofport: OfPort,
    /// `phy-<bridge>` port number on the physical bridge.
    pub phys_ofport: OfPort,
}

impl std::fmt::Debug for PhysicalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalBridge")
            .field("bridge", &self.bridge.name())
            .field("int_ofport", &self.int_ofport)
            .field("phys_ofport", &self.phys_ofport)
            .finish()
    }
}

/// A tunnel port on the tunnel bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPort {
    pub port_name: String,
    pub ofport: OfPort,
}

pub struct FlowProgrammer {
    int_br: Arc<dyn Bridge>,
    /// Present only when tunneling is enabled.
    tun_br: Option<Arc<dyn Bridge>>,
    phys_brs: HashMap<String, PhysicalBridge>,
    tags: TagAllocator,
    bindings: HashMap<String, NetworkBinding>,
    /// Tunnel type -> remote ip -> port.
    tun_br_ofports: HashMap<TunnelType, BTreeMap<String, TunnelPort>>,
    local_ip: String,
    vxlan_udp_port: u16,
}

/// VLAN segmentation ids must fit the 802.1Q field and stay off the reserved values.
fn vlan_segment(segmentation_id: Option<u32>) -> Option<u16> {
    segmentation_id
        .and_then(|s| u16::try_from(s).ok())
        .filter(|s| (1..=ofagent_types::MAX_VLAN_TAG).contains(s))
}

/// Outbound broadcast/multicast for one tunnel network: strip the local
/// tag, set the key, replicate to every tunnel port of the type.
fn flood_flow(lvid: u16, segmentation_id: u32, ofports: &BTreeSet<OfPort>) -> AgentResult<FlowMod> {
    let mut actions = vec![
        Action::PopVlan,
        Action::SetTunnelId(u64::from(segmentation_id)),
    ];
    actions.extend(ofports.iter().map(|p| Action::Output(PortNo::Port(*p))));
    Ok(FlowMod::add(FLOOD_TO_TUN)
        .priority(PRIORITY_NORMAL)
        .matching(FlowMatch::new().with_vlan(lvid))
        .apply(actions)
        .build()?)
}

impl FlowProgrammer {
    pub fn new(int_br: Arc<dyn Bridge>) -> Self {
        Self {
            int_br,
            tun_br: None,
            phys_brs: HashMap::new(),
            tags: TagAllocator::default(),
            bindings: HashMap::new(),
            tun_br_ofports: HashMap::new(),
            local_ip: String::new(),
            vxlan_udp_port: DEFAULT_VXLAN_UDP_PORT,
        }
    }

    pub fn with_tag_allocator(mut self, tags: TagAllocator) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tunneling(
        mut self,
        tun_br: Arc<dyn Bridge>,
        local_ip: impl Into<String>,
        vxlan_udp_port: u16,
    ) -> Self {
        self.tun_br = Some(tun_br);
        self.local_ip = local_ip.into();
        self.vxlan_udp_port = vxlan_udp_port;
        self
    }

    pub fn with_physical_bridge(
        mut self,
        physical_network: impl Into<String>,
        bridge: PhysicalBridge,
    ) -> Self {
        self.phys_brs.insert(physical_network.into(), bridge);
        self
    }

    pub fn int_br(&self) -> &Arc<dyn Bridge> {
        &self.int_br
    }

    pub fn tun_br(&self) -> Option<&Arc<dyn Bridge>> {
        self.tun_br.as_ref()
    }

    pub fn tunneling_enabled(&self) -> bool {
        self.tun_br.is_some()
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn physical_bridge(&self, physical_network: &str) -> Option<&PhysicalBridge> {
        self.phys_brs.get(physical_network)
    }

    pub fn physical_bridge_names(&self) -> Vec<String> {
        self.phys_brs
            .values()
            .map(|p| p.bridge.name().to_string())
            .collect()
    }

    pub fn tags(&self) -> &TagAllocator {
        &self.tags
    }

    pub fn binding(&self, net_id: &str) -> Option<&NetworkBinding> {
        self.bindings.get(net_id)
    }

    pub fn bindings(&self) -> &HashMap<String, NetworkBinding> {
        &self.bindings
    }

    /// Current tunnel port numbers of one type.
    pub fn tunnel_ofports(&self, tunnel_type: TunnelType) -> BTreeSet<OfPort> {
        self.tun_br_ofports
            .get(&tunnel_type)
            .map(|ports| ports.values().map(|p| p.ofport).collect())
            .unwrap_or_default()
    }

    pub fn tunnel_port(&self, tunnel_type: TunnelType, remote_ip: &str) -> Option<&TunnelPort> {
        self.tun_br_ofports
            .get(&tunnel_type)
            .and_then(|ports| ports.get(remote_ip))
    }

    /// Remote endpoints that have a tunnel port of one type.
    pub fn tunnel_peers(&self, tunnel_type: TunnelType) -> Vec<String> {
        self.tun_br_ofports
            .get(&tunnel_type)
            .map(|ports| ports.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Network a VM interface is currently bound to.
    pub fn get_net_uuid(&self, vif_id: &str) -> Option<String> {
        self.bindings
            .iter()
            .find(|(_, b)| b.vif_ports.contains_key(vif_id))
            .map(|(net_id, _)| net_id.clone())
    }

    /// Allocates a local tag for `net_id` and installs the flows of its
    /// encapsulation. Returns `None` when the tag pool is exhausted.
    ///
    /// An already provisioned network keeps its tag.
    #[instrument(skip(self, network_type), fields(network_type = %network_type))]
    pub async fn provision_local_vlan(
        &mut self,
        net_id: &str,
        network_type: &NetworkType,
        physical_network: Option<&str>,
        segmentation_id: Option<u32>,
    ) -> AgentResult<Option<u16>> {
        if let Some(existing) = self.bindings.get(net_id) {
            return Ok(Some(existing.vlan));
        }

        let Some(lvid) = self.tags.allocate() else {
            error!("No local VLAN available for net-id={}", net_id);
            return Ok(None);
        };
        info!("Assigning {} as local vlan for net-id={}", lvid, net_id);

        let mut binding = NetworkBinding::new(
            lvid,
            network_type.clone(),
            physical_network.map(str::to_string),
            segmentation_id,
        );

        if let Err(e) = self.install_network_flows(net_id, &mut binding).await {
            warn!(
                "Provisioning net-id={} failed, releasing local vlan {}: {}",
                net_id, lvid, e
            );
            if let Err(cleanup) = self.remove_network_flows(net_id, &binding).await {
                debug!("Cleanup after failed provisioning of {}: {}", net_id, cleanup);
            }
            self.tags.release(lvid);
            return Err(e);
        }

        self.bindings.insert(net_id.to_string(), binding);
        Ok(Some(lvid))
    }

    async fn install_network_flows(
        &self,
        net_id: &str,
        binding: &mut NetworkBinding,
    ) -> AgentResult<()> {
        let lvid = binding.vlan;
        match binding.network_type.clone() {
            NetworkType::Tunnel(tunnel_type) => {
                let Some(tun_br) = &self.tun_br else {
                    error!(
                        "Cannot provision {} network for net-id={} - tunneling disabled",
                        tunnel_type, net_id
                    );
                    return Ok(());
                };
                let Some(segmentation_id) = binding.segmentation_id else {
                    error!(
                        "Cannot provision {} network for net-id={} - no segmentation id",
                        tunnel_type, net_id
                    );
                    return Ok(());
                };

                let ofports = self.tunnel_ofports(tunnel_type);
                if !ofports.is_empty() {
                    tun_br
                        .apply_flow(&flood_flow(lvid, segmentation_id, &ofports)?)
                        .await?;
                    binding.tun_ofports = ofports;
                }

                // inbound: key -> local tag, then learn
                let inbound = FlowMod::add(tun_to_lv_table(tunnel_type))
                    .priority(PRIORITY_NORMAL)
                    .matching(FlowMatch::new().with_tunnel_id(u64::from(segmentation_id)))
                    .apply(vec![Action::SetVlanVid(lvid)])
                    .goto(LEARN_FROM_TUN)
                    .build()?;
                tun_br.apply_flow(&inbound).await?;
            }
            kind @ (NetworkType::Flat | NetworkType::Vlan) => {
                let Some(phys) = binding
                    .physical_network
                    .as_deref()
                    .and_then(|p| self.phys_brs.get(p))
                else {
                    error!(
                        "Cannot provision {} network for net-id={} - no bridge for physical_network {}",
                        kind,
                        net_id,
                        binding.physical_network.as_deref().unwrap_or("None")
                    );
                    return Ok(());
                };

                let (outbound_action, inbound_match) = if kind == NetworkType::Flat {
                    (
                        Action::PopVlan,
                        FlowMatch::new()
                            .with_in_port(phys.int_ofport)
                            .with_untagged(),
                    )
                } else {
                    let Some(vid) = vlan_segment(binding.segmentation_id) else {
                        error!(
                            "Cannot provision VLAN network for net-id={} - invalid segmentation id {:?}",
                            net_id, binding.segmentation_id
                        );
                        return Ok(());
                    };
                    (
                        Action::SetVlanVid(vid),
                        FlowMatch::new().with_in_port(phys.int_ofport).with_vlan(vid),
                    )
                };

                let outbound = FlowMod::add(0)
                    .priority(PRIORITY_OUTBOUND)
                    .matching(
                        FlowMatch::new()
                            .with_in_port(phys.phys_ofport)
                            .with_vlan(lvid),
                    )
                    .apply(vec![outbound_action, Action::Output(PortNo::Normal)])
                    .build()?;
                phys.bridge.apply_flow(&outbound).await?;

                let inbound = FlowMod::add(0)
                    .priority(PRIORITY_INBOUND)
                    .matching(inbound_match)
                    .apply(vec![Action::SetVlanVid(lvid), Action::Output(PortNo::Normal)])
                    .build()?;
                self.int_br.apply_flow(&inbound).await?;
            }
            NetworkType::Local => {
                // NORMAL forwarding on the integration bridge is enough
            }
            NetworkType::Other(kind) => {
                error!(
                    "Cannot provision unknown network type {} for net-id={}",
                    kind, net_id
                );
            }
        }
        Ok(())
    }

    /// Removes the binding of `net_id`, deletes its flows and returns the
    /// tag to the pool. Returns false when the network was not provisioned.
    #[instrument(skip(self))]
    pub async fn reclaim_local_vlan(&mut self, net_id: &str) -> AgentResult<bool> {
        let Some(binding) = self.bindings.remove(net_id) else {
            debug!("Network {} not used on agent.", net_id);
            return Ok(false);
        };
        info!(
            "Reclaiming vlan = {} from net-id = {}",
            binding.vlan, net_id
        );

        let result = self.remove_network_flows(net_id, &binding).await;
        self.tags.release(binding.vlan);
        result.map(|_| true)
    }

    async fn remove_network_flows(&self, net_id: &str, binding: &NetworkBinding) -> AgentResult<()> {
        let lvid = binding.vlan;
        match &binding.network_type {
            NetworkType::Tunnel(tunnel_type) => {
                let Some(tun_br) = &self.tun_br else {
                    return Ok(());
                };
                if let Some(segmentation_id) = binding.segmentation_id {
                    let inbound = FlowMod::delete(TableId::Id(tun_to_lv_table(*tunnel_type)))
                        .matching(FlowMatch::new().with_tunnel_id(u64::from(segmentation_id)))
                        .build()?;
                    tun_br.apply_flow(&inbound).await?;
                }
                let by_tag = FlowMod::delete(TableId::All)
                    .matching(FlowMatch::new().with_vlan(lvid))
                    .build()?;
                tun_br.apply_flow(&by_tag).await?;
            }
            kind @ (NetworkType::Flat | NetworkType::Vlan) => {
                let Some(phys) = binding
                    .physical_network
                    .as_deref()
                    .and_then(|p| self.phys_brs.get(p))
                else {
                    return Ok(());
                };

                let outbound = FlowMod::delete(TableId::All)
                    .matching(
                        FlowMatch::new()
                            .with_in_port(phys.phys_ofport)
                            .with_vlan(lvid),
                    )
                    .build()?;
                phys.bridge.apply_flow(&outbound).await?;

                let inbound_match = if *kind == NetworkType::Flat {
                    FlowMatch::new()
                        .with_in_port(phys.int_ofport)
                        .with_untagged()
                } else {
                    match vlan_segment(binding.segmentation_id) {
                        Some(vid) => FlowMatch::new().with_in_port(phys.int_ofport).with_vlan(vid),
                        None => return Ok(()),
                    }
                };
                let inbound = FlowMod::delete(TableId::All)
                    .matching(inbound_match)
                    .build()?;
                self.int_br.apply_flow(&inbound).await?;
            }
            NetworkType::Local => {}
            NetworkType::Other(kind) => {
                error!(
                    "Cannot reclaim unknown network type {} for net-id={}",
                    kind, net_id
                );
            }
        }
        Ok(())
    }

    /// Binds a VM port to its network, provisioning the network first if
    /// needed. Returns false when no local tag could be allocated.
    pub async fn port_bound(&mut self, port: &VifPort, binding: &PortBinding) -> AgentResult<bool> {
        // a port lives on one network at a time
        if let Some(previous) = self.get_net_uuid(&port.vif_id) {
            if previous != binding.network_id {
                info!(
                    "Port {} moved from net-id={} to net-id={}",
                    port.vif_id, previous, binding.network_id
                );
                self.port_unbound(&port.vif_id, Some(&previous)).await?;
            }
        }

        let Some(lvid) = self
            .provision_local_vlan(
                &binding.network_id,
                &binding.network_type,
                binding.physical_network.as_deref(),
                binding.segmentation_id,
            )
            .await?
        else {
            warn!(
                "Port {} not bound: net-id={} has no local vlan",
                port.vif_id, binding.network_id
            );
            return Ok(false);
        };

        if let Some(network) = self.bindings.get_mut(&binding.network_id) {
            network.vif_ports.insert(port.vif_id.clone(), port.clone());
        }

        self.int_br.set_port_tag(&port.port_name, lvid).await?;
        if port.ofport.is_valid() {
            // drop leftovers of a previous binding on the same port number
            let stale = FlowMod::delete(TableId::All)
                .matching(FlowMatch::new().with_in_port(port.ofport))
                .build()?;
            self.int_br.apply_flow(&stale).await?;
        }
        Ok(true)
    }

    /// Removes a VM port from its network and reclaims the network when it
    /// was the last port.
    pub async fn port_unbound(&mut self, vif_id: &str, net_id: Option<&str>) -> AgentResult<()> {
        let net_id = match net_id {
            Some(n) => n.to_string(),
            None => match self.get_net_uuid(vif_id) {
                Some(n) => n,
                None => {
                    info!("port_unbound() no network holds vif {}", vif_id);
                    return Ok(());
                }
            },
        };

        let Some(network) = self.bindings.get_mut(&net_id) else {
            info!("port_unbound() net_uuid {} not in local_vlan_map", net_id);
            return Ok(());
        };
        network.vif_ports.remove(vif_id);

        if network.vif_ports.is_empty() {
            self.reclaim_local_vlan(&net_id).await?;
        }
        Ok(())
    }

    /// Parks a port without a valid binding on the dead tag and drops its traffic.
    pub async fn port_dead(&mut self, port: &VifPort) -> AgentResult<()> {
        self.int_br
            .set_port_tag(&port.port_name, DEAD_VLAN_TAG)
            .await?;
        if !port.ofport.is_valid() {
            warn!("Port {} has no ofport, drop flow not installed", port.port_name);
            return Ok(());
        }
        let drop = FlowMod::add(0)
            .priority(PRIORITY_DROP)
            .matching(FlowMatch::new().with_in_port(port.ofport))
            .build()?;
        self.int_br.apply_flow(&drop).await
    }

    /// Binds or quarantines a port according to its admin state.
    ///
    /// Returns false when an admin-up port could not get a local vlan; the
    /// port is quarantined instead and must not be reported up.
    pub async fn treat_vif_port(
        &mut self,
        vif_port: Option<&VifPort>,
        binding: &PortBinding,
    ) -> AgentResult<bool> {
        match vif_port {
            Some(port) if binding.admin_state_up => {
                if self.port_bound(port, binding).await? {
                    return Ok(true);
                }
                self.port_dead(port).await?;
                Ok(false)
            }
            Some(port) => {
                self.port_dead(port).await?;
                Ok(true)
            }
            None => {
                debug!("No VIF port for port {} defined on agent.", binding.port_id);
                Ok(true)
            }
        }
    }

    /// Creates a tunnel port to `remote_ip`, steers its ingress into the
    /// per-type table and refreshes the flood flows of every network of
    /// that type. Returns `None` when the port could not be attached.
    #[instrument(skip(self))]
    pub async fn setup_tunnel_port(
        &mut self,
        port_name: &str,
        remote_ip: &str,
        tunnel_type: TunnelType,
    ) -> AgentResult<Option<OfPort>> {
        let Some(tun_br) = self.tun_br.clone() else {
            error!(
                "Cannot set up {} tunnel port to {} - tunneling disabled",
                tunnel_type, remote_ip
            );
            return Ok(None);
        };

        let spec = TunnelPortSpec {
            port_name: port_name.to_string(),
            remote_ip: remote_ip.to_string(),
            local_ip: self.local_ip.clone(),
            tunnel_type,
            vxlan_udp_port: self.vxlan_udp_port,
        };
        let ofport = tun_br.add_tunnel_port(&spec).await?;
        if !ofport.is_valid() {
            error!(
                "Failed to set-up {} tunnel port to {}",
                tunnel_type, remote_ip
            );
            return Ok(None);
        }

        self.tun_br_ofports.entry(tunnel_type).or_default().insert(
            remote_ip.to_string(),
            TunnelPort {
                port_name: port_name.to_string(),
                ofport,
            },
        );

        let ingress = FlowMod::add(0)
            .priority(PRIORITY_NORMAL)
            .matching(FlowMatch::new().with_in_port(ofport))
            .goto(tun_to_lv_table(tunnel_type))
            .build()?;
        tun_br.apply_flow(&ingress).await?;

        self.refresh_flood_flows(tunnel_type).await?;
        Ok(Some(ofport))
    }

    /// Reinstalls the flood flow of every network of `tunnel_type` from the
    /// complete current tunnel port set.
    async fn refresh_flood_flows(&mut self, tunnel_type: TunnelType) -> AgentResult<()> {
        let Some(tun_br) = self.tun_br.clone() else {
            return Ok(());
        };
        let ofports = self.tunnel_ofports(tunnel_type);

        for network in self
            .bindings
            .values_mut()
            .filter(|b| b.network_type.tunnel_type() == Some(tunnel_type))
        {
            let Some(segmentation_id) = network.segmentation_id else {
                continue;
            };
            let flow = if ofports.is_empty() {
                FlowMod::delete(TableId::Id(FLOOD_TO_TUN))
                    .matching(FlowMatch::new().with_vlan(network.vlan))
                    .build()?
            } else {
                flood_flow(network.vlan, segmentation_id, &ofports)?
            };
            tun_br.apply_flow(&flow).await?;
            network.tun_ofports = ofports.clone();
        }
        Ok(())
    }

    /// Stops flooding to the tunnel port towards `remote_ip` and deletes it.
    /// Returns false when no such port exists.
    #[instrument(skip(self))]
    pub async fn retire_tunnel_peer(
        &mut self,
        tunnel_type: TunnelType,
        remote_ip: &str,
    ) -> AgentResult<bool> {
        let Some(port) = self
            .tun_br_ofports
            .get_mut(&tunnel_type)
            .and_then(|ports| ports.remove(remote_ip))
        else {
            return Ok(false);
        };
        self.refresh_flood_flows(tunnel_type).await?;
        self.delete_tunnel_port(tunnel_type, remote_ip, &port).await?;
        Ok(true)
    }

    async fn delete_tunnel_port(
        &self,
        tunnel_type: TunnelType,
        remote_ip: &str,
        port: &TunnelPort,
    ) -> AgentResult<()> {
        let Some(tun_br) = &self.tun_br else {
            return Ok(());
        };
        tun_br.delete_port(&port.port_name).await?;
        let ingress = FlowMod::delete(TableId::All)
            .matching(FlowMatch::new().with_in_port(port.ofport))
            .build()?;
        tun_br.apply_flow(&ingress).await?;
        info!("Removed {} tunnel port {} to {}", tunnel_type, port.port_name, remote_ip);
        Ok(())
    }

    /// Deletes a tunnel port unless a network still floods to it.
    /// Returns whether the port was removed.
    pub async fn cleanup_tunnel_port(
        &mut self,
        tun_ofport: OfPort,
        tunnel_type: TunnelType,
    ) -> AgentResult<bool> {
        if self
            .bindings
            .values()
            .any(|b| b.tun_ofports.contains(&tun_ofport))
        {
            debug!("Tunnel port {} still in use", tun_ofport);
            return Ok(false);
        }
        if self.tun_br.is_none() {
            return Ok(false);
        }
        let Some(remote_ip) = self.tun_br_ofports.get(&tunnel_type).and_then(|ports| {
            ports
                .iter()
                .find(|(_, p)| p.ofport == tun_ofport)
                .map(|(ip, _)| ip.clone())
        }) else {
            return Ok(false);
        };
        let Some(port) = self
            .tun_br_ofports
            .get_mut(&tunnel_type)
            .and_then(|ports| ports.remove(&remote_ip))
        else {
            return Ok(false);
        };

        self.delete_tunnel_port(tunnel_type, &remote_ip, &port).await?;
        Ok(true)
    }
}
