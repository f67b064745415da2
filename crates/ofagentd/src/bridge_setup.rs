//! Bridge bootstrap.
//!
//! Runs once at startup, before the reconciliation loop. Every failure here
//! is fatal to the agent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use ofagent_common::shell::{self, as_root};
use ofagent_common::{AgentError, AgentResult};
use ofagent_types::{MacAddress, OfPort, TunnelType};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::commands::*;
use crate::constants::*;
use crate::flow::{Action, FlowMatch, FlowMod, PortNo, TableId};
use crate::flow_programmer::PhysicalBridge;

/// Builds a handle for a bridge discovered at runtime.
pub type BridgeFactory = dyn Fn(&str) -> Arc<dyn Bridge> + Send + Sync;

/// Host network device operations needed to plumb physical bridges.
#[async_trait]
pub trait HostLinks: Send + Sync {
    async fn device_exists(&self, name: &str) -> bool;

    async fn delete_link(&self, name: &str) -> AgentResult<()>;

    async fn udev_settle(&self) -> AgentResult<()>;

    async fn add_veth(&self, name: &str, peer: &str) -> AgentResult<()>;

    async fn set_link_up(&self, name: &str) -> AgentResult<()>;

    async fn set_link_mtu(&self, name: &str, mtu: u32) -> AgentResult<()>;
}

/// [`HostLinks`] over the `ip` and `udevadm` commands.
#[derive(Debug, Clone)]
pub struct IpLinks {
    root_helper: String,
}

impl IpLinks {
    pub fn new(root_helper: impl Into<String>) -> Self {
        Self {
            root_helper: root_helper.into(),
        }
    }

    async fn run(&self, cmd: &str) -> AgentResult<()> {
        shell::exec_or_throw(&as_root(&self.root_helper, cmd)).await?;
        Ok(())
    }
}

#[async_trait]
impl HostLinks for IpLinks {
    async fn device_exists(&self, name: &str) -> bool {
        match shell::exec(&build_device_exists_cmd(name)).await {
            Ok(result) => result.success(),
            Err(e) => {
                debug!("Unable to query device {}: {}", name, e);
                false
            }
        }
    }

    async fn delete_link(&self, name: &str) -> AgentResult<()> {
        self.run(&build_del_link_cmd(name)).await
    }

    async fn udev_settle(&self) -> AgentResult<()> {
        self.run(&build_udev_settle_cmd()).await
    }

    async fn add_veth(&self, name: &str, peer: &str) -> AgentResult<()> {
        self.run(&build_add_veth_cmd(name, peer)).await
    }

    async fn set_link_up(&self, name: &str) -> AgentResult<()> {
        self.run(&build_set_link_up_cmd(name)).await
    }

    async fn set_link_mtu(&self, name: &str, mtu: u32) -> AgentResult<()> {
        self.run(&build_set_link_mtu_cmd(name, mtu)).await
    }
}

/// Polls for the bridge's datapath id, `retry_max` times `backoff` apart.
pub async fn wait_for_datapath(
    bridge: &dyn Bridge,
    retry_max: u32,
    backoff: Duration,
) -> AgentResult<String> {
    let attempts = retry_max.max(1);
    for attempt in 1..=attempts {
        match bridge.datapath_id().await {
            Ok(Some(id)) => {
                debug!(bridge = bridge.name(), "Datapath {} found", id);
                return Ok(id);
            }
            Ok(None) => debug!(
                bridge = bridge.name(),
                "Datapath not ready ({}/{})", attempt, attempts
            ),
            Err(e) => debug!(
                bridge = bridge.name(),
                "Datapath lookup failed ({}/{}): {}", attempt, attempts, e
            ),
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    Err(AgentError::DatapathUnavailable {
        bridge: bridge.name().to_string(),
        attempts,
    })
}

async fn setup_ofp_with_backoff(
    bridge: &dyn Bridge,
    retry_max: u32,
    backoff: Duration,
) -> AgentResult<()> {
    bridge.set_protocols(OPENFLOW_PROTOCOL).await.map_err(|e| {
        AgentError::fatal(format!(
            "Unable to set {} on {}: {}",
            OPENFLOW_PROTOCOL,
            bridge.name(),
            e
        ))
    })?;
    wait_for_datapath(bridge, retry_max, backoff).await?;
    Ok(())
}

/// Switches the bridge to OpenFlow 1.3 and waits for its datapath.
pub async fn setup_ofp(bridge: &dyn Bridge, retry_max: u32) -> AgentResult<()> {
    setup_ofp_with_backoff(bridge, retry_max, Duration::from_secs(1)).await
}

async fn delete_all_flows(bridge: &dyn Bridge) -> AgentResult<()> {
    bridge.apply_flow(&FlowMod::delete(TableId::All).build()?).await
}

async fn install_normal(bridge: &dyn Bridge) -> AgentResult<()> {
    let normal = FlowMod::add(0)
        .priority(PRIORITY_NORMAL)
        .apply(vec![Action::Output(PortNo::Normal)])
        .build()?;
    bridge.apply_flow(&normal).await
}

async fn install_port_drop(bridge: &dyn Bridge, ofport: OfPort) -> AgentResult<()> {
    let drop = FlowMod::add(0)
        .priority(PRIORITY_DROP)
        .matching(FlowMatch::new().with_in_port(ofport))
        .build()?;
    bridge.apply_flow(&drop).await
}

/// Clears the integration bridge down to plain L2 learning.
pub async fn setup_integration_br(
    int_br: &dyn Bridge,
    int_peer_patch_port: &str,
    retry_max: u32,
) -> AgentResult<()> {
    setup_integration_br_with_backoff(int_br, int_peer_patch_port, retry_max, Duration::from_secs(1))
        .await
}

async fn setup_integration_br_with_backoff(
    int_br: &dyn Bridge,
    int_peer_patch_port: &str,
    retry_max: u32,
    backoff: Duration,
) -> AgentResult<()> {
    setup_ofp_with_backoff(int_br, retry_max, backoff).await?;
    int_br.delete_port(int_peer_patch_port).await?;
    delete_all_flows(int_br).await?;
    install_normal(int_br).await
}

/// Patch port numbers linking the integration and tunnel bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchPorts {
    /// `int_peer_patch_port` on the integration bridge.
    pub patch_tun: OfPort,
    /// `tun_peer_patch_port` on the tunnel bridge.
    pub patch_int: OfPort,
}

/// Recreates the tunnel bridge, patches it to the integration bridge and
/// installs the static tunnel pipeline.
pub async fn setup_tunnel_br(
    int_br: &dyn Bridge,
    tun_br: &dyn Bridge,
    int_peer_patch_port: &str,
    tun_peer_patch_port: &str,
    retry_max: u32,
) -> AgentResult<PatchPorts> {
    setup_tunnel_br_with_backoff(
        int_br,
        tun_br,
        int_peer_patch_port,
        tun_peer_patch_port,
        retry_max,
        Duration::from_secs(1),
    )
    .await
}

async fn setup_tunnel_br_with_backoff(
    int_br: &dyn Bridge,
    tun_br: &dyn Bridge,
    int_peer_patch_port: &str,
    tun_peer_patch_port: &str,
    retry_max: u32,
    backoff: Duration,
) -> AgentResult<PatchPorts> {
    tun_br.reset_bridge().await?;
    setup_ofp_with_backoff(tun_br, retry_max, backoff).await?;

    let patch_tun = int_br
        .add_patch_port(int_peer_patch_port, tun_peer_patch_port)
        .await?;
    let patch_int = tun_br
        .add_patch_port(tun_peer_patch_port, int_peer_patch_port)
        .await?;
    if !patch_tun.is_valid() || !patch_int.is_valid() {
        return Err(AgentError::fatal(
            "Failed to create OVS patch port. Cannot have tunneling enabled on this agent, \
             since this version of OVS does not support tunnels or patch ports",
        ));
    }

    delete_all_flows(tun_br).await?;

    let mut flows = vec![
        // table 0 sorts traffic by in_port
        FlowMod::add(0)
            .priority(PRIORITY_NORMAL)
            .matching(FlowMatch::new().with_in_port(patch_int))
            .goto(PATCH_LV_TO_TUN)
            .build()?,
        FlowMod::add(0).priority(PRIORITY_DEFAULT).build()?,
        // from patch-int: unicast and flooded traffic split
        FlowMod::add(PATCH_LV_TO_TUN)
            .priority(PRIORITY_NORMAL)
            .matching(FlowMatch::new().with_eth_dst(MacAddress::ZERO, MacAddress::MULTICAST_BIT))
            .goto(UCAST_TO_TUN)
            .build()?,
        FlowMod::add(PATCH_LV_TO_TUN)
            .priority(PRIORITY_NORMAL)
            .matching(
                FlowMatch::new().with_eth_dst(MacAddress::MULTICAST_BIT, MacAddress::MULTICAST_BIT),
            )
            .goto(FLOOD_TO_TUN)
            .build()?,
    ];
    for tunnel_type in TunnelType::ALL {
        flows.push(
            FlowMod::add(tun_to_lv_table(tunnel_type))
                .priority(PRIORITY_DEFAULT)
                .build()?,
        );
    }
    flows.extend([
        FlowMod::add(LEARN_FROM_TUN)
            .priority(PRIORITY_NORMAL)
            .apply(vec![Action::Output(PortNo::Port(patch_int))])
            .build()?,
        // unknown unicast is flooded for now
        FlowMod::add(UCAST_TO_TUN)
            .priority(PRIORITY_DEFAULT)
            .goto(FLOOD_TO_TUN)
            .build()?,
        FlowMod::add(FLOOD_TO_TUN)
            .priority(PRIORITY_DEFAULT)
            .build()?,
    ]);

    for flow in &flows {
        tun_br.apply_flow(flow).await?;
    }
    Ok(PatchPorts {
        patch_tun,
        patch_int,
    })
}

/// Settings for [`setup_physical_bridges`].
pub struct PhysicalBridgeSetup<'a> {
    pub int_br: &'a Arc<dyn Bridge>,
    pub factory: &'a BridgeFactory,
    pub links: &'a dyn HostLinks,
    pub veth_mtu: Option<u32>,
    pub retry_max: u32,
    pub backoff: Duration,
}

/// Connects every mapped physical bridge to the integration bridge through
/// an `int-<bridge>`/`phy-<bridge>` veth pair.
pub async fn setup_physical_bridges(
    setup: &PhysicalBridgeSetup<'_>,
    bridge_mappings: &BTreeMap<String, String>,
) -> AgentResult<Vec<(String, PhysicalBridge)>> {
    let int_br = setup.int_br;
    let mut phys_brs = Vec::new();

    for (physical_network, bridge) in bridge_mappings {
        info!(
            "Mapping physical network {} to bridge {}",
            physical_network, bridge
        );
        if !setup.links.device_exists(bridge).await {
            return Err(AgentError::fatal(format!(
                "Bridge {} for physical network {} does not exist",
                bridge, physical_network
            )));
        }

        let br = (setup.factory)(bridge);
        setup_ofp_with_backoff(br.as_ref(), setup.retry_max, setup.backoff).await?;
        delete_all_flows(br.as_ref()).await?;
        install_normal(br.as_ref()).await?;

        let int_veth = format!("{}{}", VETH_INTEGRATION_PREFIX, bridge);
        let phys_veth = format!("{}{}", VETH_PHYSICAL_PREFIX, bridge);
        int_br.delete_port(&int_veth).await?;
        br.delete_port(&phys_veth).await?;
        if setup.links.device_exists(&int_veth).await {
            setup.links.delete_link(&int_veth).await?;
            // the removal must finish before the pair is recreated
            setup.links.udev_settle().await?;
        }
        setup.links.add_veth(&int_veth, &phys_veth).await?;

        let int_ofport = int_br.add_port(&int_veth).await?;
        let phys_ofport = br.add_port(&phys_veth).await?;

        // block untranslated traffic between the bridges
        install_port_drop(int_br.as_ref(), int_ofport).await?;
        install_port_drop(br.as_ref(), phys_ofport).await?;

        setup.links.set_link_up(&int_veth).await?;
        setup.links.set_link_up(&phys_veth).await?;
        if let Some(mtu) = setup.veth_mtu {
            setup.links.set_link_mtu(&int_veth, mtu).await?;
            setup.links.set_link_mtu(&phys_veth, mtu).await?;
        }

        phys_brs.push((
            physical_network.clone(),
            PhysicalBridge {
                bridge: br,
                int_ofport,
                phys_ofport,
            },
        ));
    }
    Ok(phys_brs)
}

/// Bridges the agent only watches: everything but the integration, tunnel
/// and physical bridges, restricted to those whose `bridge-id` is their name.
pub async fn setup_ancillary_bridges(
    all_bridges: Vec<String>,
    managed: &[String],
    factory: &BridgeFactory,
) -> AgentResult<Vec<Arc<dyn Bridge>>> {
    let mut ancillary = Vec::new();
    for name in all_bridges {
        if managed.contains(&name) {
            continue;
        }
        let br = factory(&name);
        if br.bridge_external_id().await?.as_deref() != Some(name.as_str()) {
            continue;
        }
        info!("Adding {} to list of bridges.", name);
        ancillary.push(br);
    }
    Ok(ancillary)
}

/// An Open vSwitch release number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OvsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OvsVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const fn minimum_vxlan() -> Self {
        Self::new(MINIMUM_OVS_VXLAN_VERSION.0, MINIMUM_OVS_VXLAN_VERSION.1, 0)
    }
}

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("Invalid regex pattern"));

/// First `x.y[.z]` in `text`.
pub fn parse_ovs_version(text: &str) -> Option<OvsVersion> {
    let caps = VERSION_RE.captures(text)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some(OvsVersion::new(num(1)?, num(2)?, num(3).unwrap_or(0)))
}

/// Kernel module version from `modinfo` output.
pub fn parse_klm_version(modinfo: &str) -> Option<OvsVersion> {
    modinfo
        .lines()
        .find_map(|l| l.trim().strip_prefix("version:"))
        .and_then(parse_ovs_version)
}

/// Userspace below `min`, or unknown, is fatal. A known kernel module below
/// `min` is fatal; an unknown one only warns.
pub fn evaluate_ovs_versions(
    usr: Option<OvsVersion>,
    klm: Option<OvsVersion>,
    min: OvsVersion,
) -> AgentResult<()> {
    let Some(usr) = usr else {
        return Err(AgentError::fatal(format!(
            "Unable to determine Open vSwitch version. Please ensure that its version is \
             {}.{} or newer to use VXLAN tunnels",
            min.major, min.minor
        )));
    };
    if usr < min {
        return Err(AgentError::fatal(format!(
            "Failed userspace version check for Open vSwitch with VXLAN support: \
             {}.{}.{} < {}.{}",
            usr.major, usr.minor, usr.patch, min.major, min.minor
        )));
    }
    match klm {
        Some(klm) if klm < min => Err(AgentError::fatal(format!(
            "Failed kernel version check for Open vSwitch with VXLAN support: \
             {}.{}.{} < {}.{}",
            klm.major, klm.minor, klm.patch, min.major, min.minor
        ))),
        Some(_) => Ok(()),
        None => {
            warn!(
                "Cannot determine kernel Open vSwitch version, please ensure your Open vSwitch \
                 kernel module is at least version {}.{} to support VXLAN tunnels.",
                min.major, min.minor
            );
            Ok(())
        }
    }
}

/// Checks the installed Open vSwitch against the VXLAN minimum.
pub async fn check_ovs_version(root_helper: &str) -> AgentResult<()> {
    debug!("Checking OVS version for VXLAN support");
    let usr = match shell::exec_or_throw(&as_root(root_helper, &build_vsctl_version_cmd())).await {
        Ok(out) => parse_ovs_version(&out),
        Err(e) => {
            debug!("Unable to read ovs-vsctl version: {}", e);
            None
        }
    };
    let klm = match shell::exec_or_throw(&build_modinfo_openvswitch_cmd()).await {
        Ok(out) => parse_klm_version(&out),
        Err(e) => {
            debug!("Unable to read openvswitch module version: {}", e);
            None
        }
    };
    evaluate_ovs_versions(usr, klm, OvsVersion::minimum_vxlan())
}
