//! Table numbers, priorities and naming used on the bridges.

use ofagent_types::TunnelType;

/// Tunnel bridge: traffic arriving from the integration bridge patch port.
pub const PATCH_LV_TO_TUN: u8 = 1;
/// Tunnel bridge: GRE ingress, tunnel key to local tag.
pub const GRE_TUN_TO_LV: u8 = 2;
/// Tunnel bridge: VXLAN ingress, tunnel key to local tag.
pub const VXLAN_TUN_TO_LV: u8 = 3;
/// Tunnel bridge: MAC learning for traffic coming from tunnels.
pub const LEARN_FROM_TUN: u8 = 10;
/// Tunnel bridge: known unicast towards a tunnel.
pub const UCAST_TO_TUN: u8 = 20;
/// Tunnel bridge: broadcast, multicast and unknown unicast replication.
pub const FLOOD_TO_TUN: u8 = 21;

/// Table-miss entries.
pub const PRIORITY_DEFAULT: u16 = 0;
/// NORMAL forwarding and classification.
pub const PRIORITY_NORMAL: u16 = 1;
/// Drop rules for dead ports and the physical veth pair.
pub const PRIORITY_DROP: u16 = 2;
/// Inbound translation on the integration bridge.
pub const PRIORITY_INBOUND: u16 = 3;
/// Outbound translation on a physical bridge.
pub const PRIORITY_OUTBOUND: u16 = 4;

/// Integration-bridge end of the veth pair towards a physical bridge.
pub const VETH_INTEGRATION_PREFIX: &str = "int-";
/// Physical-bridge end of the veth pair.
pub const VETH_PHYSICAL_PREFIX: &str = "phy-";

/// OpenFlow version the bridges are switched to.
pub const OPENFLOW_PROTOCOL: &str = "OpenFlow13";

/// Oldest Open vSwitch release with VXLAN support (major, minor).
pub const MINIMUM_OVS_VXLAN_VERSION: (u32, u32) = (1, 10);

/// IANA VXLAN port. Tunnel ports only carry `dst_port` when it differs.
pub const DEFAULT_VXLAN_UDP_PORT: u16 = 4789;

pub const AGENT_BINARY: &str = "ofagentd";
pub const AGENT_TYPE: &str = "OpenFlow agent";
pub const AGENT_TOPIC: &str = "l2_agent";

/// Ingress table for a tunnel encapsulation.
pub fn tun_to_lv_table(tunnel_type: TunnelType) -> u8 {
    match tunnel_type {
        TunnelType::Gre => GRE_TUN_TO_LV,
        TunnelType::Vxlan => VXLAN_TUN_TO_LV,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_ordered_for_goto() {
        assert!(PATCH_LV_TO_TUN < UCAST_TO_TUN);
        assert!(PATCH_LV_TO_TUN < FLOOD_TO_TUN);
        assert!(UCAST_TO_TUN < FLOOD_TO_TUN);
        for t in TunnelType::ALL {
            assert!(tun_to_lv_table(t) < LEARN_FROM_TUN);
        }
    }

    #[test]
    fn test_priorities() {
        assert!(PRIORITY_DEFAULT < PRIORITY_NORMAL);
        assert!(PRIORITY_NORMAL < PRIORITY_DROP);
        assert!(PRIORITY_INBOUND < PRIORITY_OUTBOUND);
    }
}
