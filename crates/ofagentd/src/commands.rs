//! Shell command builders for switch and host link operations.
//!
//! Builders return the bare command; callers prefix the root helper.

use ofagent_common::shell::{
    shellquote, IP_CMD, MODINFO_CMD, OVSDB_CLIENT_CMD, OVS_OFCTL_CMD, OVS_VSCTL_CMD, UDEVADM_CMD,
};
use ofagent_types::TunnelType;

use crate::bridge::TunnelPortSpec;
use crate::constants::{DEFAULT_VXLAN_UDP_PORT, OPENFLOW_PROTOCOL};
use crate::flow::{FlowCommand, FlowMod};

/// Seconds ovs-vsctl waits for ovsdb-server before giving up.
pub const VSCTL_TIMEOUT_SECS: u32 = 10;

fn vsctl(args: &str) -> String {
    format!("{} --timeout={} {}", OVS_VSCTL_CMD, VSCTL_TIMEOUT_SECS, args)
}

pub fn build_set_protocols_cmd(bridge: &str, protocols: &str) -> String {
    vsctl(&format!(
        "-- set Bridge {} protocols={}",
        shellquote(bridge),
        shellquote(protocols)
    ))
}

pub fn build_get_datapath_id_cmd(bridge: &str) -> String {
    vsctl(&format!("-- get Bridge {} datapath_id", shellquote(bridge)))
}

/// Sets the switch-level access tag of a port (not an OpenFlow match value).
pub fn build_set_port_tag_cmd(port: &str, tag: u16) -> String {
    vsctl(&format!("-- set Port {} tag={}", shellquote(port), tag))
}

pub fn build_get_ofport_cmd(port: &str) -> String {
    vsctl(&format!("-- get Interface {} ofport", shellquote(port)))
}

pub fn build_add_port_cmd(bridge: &str, port: &str) -> String {
    vsctl(&format!(
        "-- --may-exist add-port {} {}",
        shellquote(bridge),
        shellquote(port)
    ))
}

pub fn build_add_patch_port_cmd(bridge: &str, local_name: &str, remote_name: &str) -> String {
    vsctl(&format!(
        "-- --may-exist add-port {br} {local} -- set Interface {local} type=patch options:peer={remote}",
        br = shellquote(bridge),
        local = shellquote(local_name),
        remote = shellquote(remote_name)
    ))
}

/// Tunnel ports carry the key in the flow (`in_key=flow`, `out_key=flow`)
/// so one port serves every network of its type.
pub fn build_add_tunnel_port_cmd(bridge: &str, spec: &TunnelPortSpec) -> String {
    let mut cmd = format!(
        "-- --may-exist add-port {br} {port} -- set Interface {port} type={ty} \
         options:remote_ip={remote} options:local_ip={local} \
         options:in_key=flow options:out_key=flow",
        br = shellquote(bridge),
        port = shellquote(&spec.port_name),
        ty = spec.tunnel_type,
        remote = shellquote(&spec.remote_ip),
        local = shellquote(&spec.local_ip),
    );
    if spec.tunnel_type == TunnelType::Vxlan && spec.vxlan_udp_port != DEFAULT_VXLAN_UDP_PORT {
        cmd.push_str(&format!(" options:dst_port={}", spec.vxlan_udp_port));
    }
    vsctl(&cmd)
}

pub fn build_del_port_cmd(bridge: &str, port: &str) -> String {
    vsctl(&format!(
        "-- --if-exists del-port {} {}",
        shellquote(bridge),
        shellquote(port)
    ))
}

pub fn build_reset_bridge_cmd(bridge: &str) -> String {
    let br = shellquote(bridge);
    vsctl(&format!("-- --if-exists del-br {br} -- add-br {br}", br = br))
}

pub fn build_list_ports_cmd(bridge: &str) -> String {
    vsctl(&format!("-- list-ports {}", shellquote(bridge)))
}

pub fn build_list_interfaces_cmd() -> String {
    vsctl("--format=json -- --columns=name,external_ids,ofport list Interface")
}

pub fn build_find_interface_by_iface_id_cmd(vif_id: &str) -> String {
    vsctl(&format!(
        "--format=json -- --columns=name,external_ids,ofport find Interface external_ids:iface-id={}",
        shellquote(vif_id)
    ))
}

pub fn build_get_bridge_id_cmd(bridge: &str) -> String {
    vsctl(&format!("-- br-get-external-id {} bridge-id", shellquote(bridge)))
}

pub fn build_get_mac_in_use_cmd(bridge: &str) -> String {
    vsctl(&format!("-- get Interface {} mac_in_use", shellquote(bridge)))
}

pub fn build_list_bridges_cmd() -> String {
    vsctl("-- list-br")
}

pub fn build_vsctl_version_cmd() -> String {
    format!("{} --version", OVS_VSCTL_CMD)
}

pub fn build_modinfo_openvswitch_cmd() -> String {
    format!("{} openvswitch", MODINFO_CMD)
}

/// `add-flow` for adds, `del-flows` for deletes. An empty delete spec
/// clears the whole bridge.
pub fn build_flow_cmd(bridge: &str, flow: &FlowMod) -> String {
    let spec = flow.to_string();
    match flow.command() {
        FlowCommand::Add => format!(
            "{} -O {} add-flow {} {}",
            OVS_OFCTL_CMD,
            OPENFLOW_PROTOCOL,
            shellquote(bridge),
            shellquote(&spec)
        ),
        FlowCommand::Delete if spec.is_empty() => format!(
            "{} -O {} del-flows {}",
            OVS_OFCTL_CMD,
            OPENFLOW_PROTOCOL,
            shellquote(bridge)
        ),
        FlowCommand::Delete => format!(
            "{} -O {} del-flows {} {}",
            OVS_OFCTL_CMD,
            OPENFLOW_PROTOCOL,
            shellquote(bridge),
            shellquote(&spec)
        ),
    }
}

pub fn build_ovsdb_monitor_cmd() -> String {
    format!(
        "{} monitor Interface name,ofport,external_ids --format=json",
        OVSDB_CLIENT_CMD
    )
}

pub fn build_device_exists_cmd(device: &str) -> String {
    format!("{} link show dev {}", IP_CMD, shellquote(device))
}

pub fn build_del_link_cmd(device: &str) -> String {
    format!("{} link delete dev {}", IP_CMD, shellquote(device))
}

pub fn build_udev_settle_cmd() -> String {
    format!("{} settle --timeout=10", UDEVADM_CMD)
}

pub fn build_add_veth_cmd(name: &str, peer: &str) -> String {
    format!(
        "{} link add {} type veth peer name {}",
        IP_CMD,
        shellquote(name),
        shellquote(peer)
    )
}

pub fn build_set_link_up_cmd(device: &str) -> String {
    format!("{} link set dev {} up", IP_CMD, shellquote(device))
}

pub fn build_set_link_mtu_cmd(device: &str, mtu: u32) -> String {
    format!("{} link set dev {} mtu {}", IP_CMD, shellquote(device), mtu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowMatch, TableId};
    use ofagent_types::OfPort;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_port_tag_cmd() {
        assert_eq!(
            build_set_port_tag_cmd("tap1", 4095),
            "/usr/bin/ovs-vsctl --timeout=10 -- set Port \"tap1\" tag=4095"
        );
    }

    #[test]
    fn test_tunnel_port_cmd() {
        let mut spec = TunnelPortSpec {
            port_name: "vxlan-10.0.0.2".to_string(),
            remote_ip: "10.0.0.2".to_string(),
            local_ip: "10.0.0.1".to_string(),
            tunnel_type: TunnelType::Vxlan,
            vxlan_udp_port: DEFAULT_VXLAN_UDP_PORT,
        };
        let cmd = build_add_tunnel_port_cmd("br-tun", &spec);
        assert!(cmd.contains("type=vxlan"));
        assert!(cmd.contains("options:remote_ip=\"10.0.0.2\""));
        assert!(cmd.contains("options:in_key=flow options:out_key=flow"));
        assert!(!cmd.contains("dst_port"));

        spec.vxlan_udp_port = 8472;
        assert!(build_add_tunnel_port_cmd("br-tun", &spec).ends_with("options:dst_port=8472"));

        spec.tunnel_type = TunnelType::Gre;
        assert!(!build_add_tunnel_port_cmd("br-tun", &spec).contains("dst_port"));
    }

    #[test]
    fn test_flow_cmds() {
        let clear = FlowMod::delete(TableId::All).build().unwrap();
        assert_eq!(
            build_flow_cmd("br-int", &clear),
            "/usr/bin/ovs-ofctl -O OpenFlow13 del-flows \"br-int\""
        );

        let delete = FlowMod::delete(TableId::All)
            .matching(FlowMatch::new().with_in_port(OfPort::new(3)))
            .build()
            .unwrap();
        assert_eq!(
            build_flow_cmd("br-int", &delete),
            "/usr/bin/ovs-ofctl -O OpenFlow13 del-flows \"br-int\" \"in_port=3\""
        );

        let add = FlowMod::add(0).priority(1).build().unwrap();
        assert_eq!(
            build_flow_cmd("br-int", &add),
            "/usr/bin/ovs-ofctl -O OpenFlow13 add-flow \"br-int\" \"table=0,priority=1,actions=drop\""
        );
    }

    #[test]
    fn test_veth_cmds() {
        assert_eq!(
            build_add_veth_cmd("int-br-eth1", "phy-br-eth1"),
            "/sbin/ip link add \"int-br-eth1\" type veth peer name \"phy-br-eth1\""
        );
        assert_eq!(
            build_set_link_mtu_cmd("int-br-eth1", 1600),
            "/sbin/ip link set dev \"int-br-eth1\" mtu 1600"
        );
    }
}
