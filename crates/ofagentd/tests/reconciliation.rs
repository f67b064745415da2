//! End-to-end reconciliation tests
//!
//! Drive the port, tunnel and notification paths against in-memory bridges
//! and an in-memory control plane, then check the resulting flow tables.

use std::collections::BTreeSet;
use std::sync::Arc;

use ofagent_types::{NetworkType, OfPort, TunnelType, DEAD_VLAN_TAG};
use ofagentd::constants::{
    DEFAULT_VXLAN_UDP_PORT, FLOOD_TO_TUN, PRIORITY_DROP, PRIORITY_INBOUND, PRIORITY_OUTBOUND,
};
use ofagentd::flow::VlanMatch;
use ofagentd::notifications::{AgentNotification, NotificationHandler, PortUpdate};
use ofagentd::plugin_rpc::{DeviceDetails, TunnelEndpoint};
use ofagentd::port_reconciler::PortSet;
use ofagentd::sim::{RecordingFirewall, SimBridge, SimPluginClient};
use ofagentd::{
    diff_ports, FlowProgrammer, PhysicalBridge, PortReconciler, TagAllocator, TunnelReconciler,
};
use pretty_assertions::assert_eq;
use tokio::sync::Mutex;

const AGENT_ID: &str = "ovs020000000001";
const HOST: &str = "compute-1";
const LOCAL_IP: &str = "10.0.0.1";

/// Switch and control plane shared by every reconciler of one test.
struct Harness {
    int_br: Arc<SimBridge>,
    tun_br: Arc<SimBridge>,
    phys_br: Arc<SimBridge>,
    plugin: Arc<SimPluginClient>,
    firewall: Arc<RecordingFirewall>,
    programmer: Arc<Mutex<FlowProgrammer>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_tags(TagAllocator::default())
    }

    fn with_tags(tags: TagAllocator) -> Self {
        let int_br = SimBridge::shared("br-int");
        let tun_br = SimBridge::shared("br-tun");
        let phys_br = SimBridge::shared("br-eth1");
        let programmer = FlowProgrammer::new(int_br.clone())
            .with_tag_allocator(tags)
            .with_tunneling(tun_br.clone(), LOCAL_IP, DEFAULT_VXLAN_UDP_PORT)
            .with_physical_bridge(
                "physnet1",
                PhysicalBridge {
                    bridge: phys_br.clone(),
                    int_ofport: OfPort::new(20),
                    phys_ofport: OfPort::new(30),
                },
            );
        Self {
            int_br,
            tun_br,
            phys_br,
            plugin: SimPluginClient::shared(),
            firewall: RecordingFirewall::shared(),
            programmer: Arc::new(Mutex::new(programmer)),
        }
    }

    fn ports(&self) -> PortReconciler {
        PortReconciler::new(
            self.programmer.clone(),
            self.plugin.clone(),
            self.firewall.clone(),
            AGENT_ID,
            HOST,
        )
    }

    fn tunnels(&self, types: Vec<TunnelType>) -> Arc<TunnelReconciler> {
        Arc::new(TunnelReconciler::new(
            self.programmer.clone(),
            self.plugin.clone(),
            LOCAL_IP,
            types,
        ))
    }

    fn notifications(&self) -> NotificationHandler {
        NotificationHandler::new(
            self.programmer.clone(),
            self.plugin.clone(),
            self.firewall.clone(),
            self.tunnels(vec![TunnelType::Gre]),
            AGENT_ID,
            HOST,
        )
    }
}

fn set(items: &[&str]) -> PortSet {
    items.iter().map(|s| s.to_string()).collect()
}

fn details(device: &str, net: &str, network_type: NetworkType, seg: Option<u32>) -> DeviceDetails {
    let physical_network = matches!(network_type, NetworkType::Vlan | NetworkType::Flat)
        .then(|| "physnet1".to_string());
    DeviceDetails {
        device: device.to_string(),
        port_id: Some(device.to_string()),
        network_id: Some(net.to_string()),
        network_type: Some(network_type),
        physical_network,
        segmentation_id: seg,
        admin_state_up: true,
    }
}

#[test]
fn test_tags_are_unique_and_returned() {
    let mut tags = TagAllocator::new(1, 64);
    let issued: Vec<u16> = std::iter::from_fn(|| tags.allocate()).collect();
    assert_eq!(issued.len(), 63);
    assert_eq!(issued.iter().collect::<BTreeSet<_>>().len(), 63);
    assert!(tags.is_exhausted());

    for tag in issued {
        assert!(tags.release(tag));
    }
    assert_eq!(tags.available(), tags.capacity());
}

#[test]
fn test_identical_port_sets_have_no_delta() {
    let ports = set(&["p1", "p2", "p3"]);
    assert_eq!(diff_ports(&ports, &ports.clone()), None);
}

#[tokio::test]
async fn test_vlan_network_lifecycle() {
    let h = Harness::new();
    let ports = h.ports();
    h.int_br.add_vif("tap1", "p1", 5);
    h.plugin
        .set_details(details("p1", "net-a", NetworkType::Vlan, Some(100)));

    assert!(!ports.treat_devices_added(&set(&["p1"])).await.unwrap());

    let lvid = {
        let programmer = h.programmer.lock().await;
        let binding = programmer.binding("net-a").unwrap();
        assert!(binding.vif_ports.contains_key("p1"));
        binding.vlan
    };
    assert_eq!(h.int_br.port_tag("tap1"), Some(lvid));

    let outbound = h.phys_br.flows();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].priority(), Some(PRIORITY_OUTBOUND));
    assert_eq!(outbound[0].flow_match().vlan, Some(VlanMatch::Tagged(lvid)));

    let inbound = h
        .int_br
        .find_flow(|f| f.priority() == Some(PRIORITY_INBOUND))
        .unwrap();
    assert_eq!(inbound.flow_match().vlan, Some(VlanMatch::Tagged(100)));
    assert_eq!(inbound.flow_match().in_port, Some(OfPort::new(20)));
    assert_eq!(h.plugin.devices_up(), vec!["p1"]);

    h.int_br.remove_vif("p1");
    assert!(!ports.treat_devices_removed(&set(&["p1"])).await.unwrap());

    let programmer = h.programmer.lock().await;
    assert!(programmer.binding("net-a").is_none());
    assert_eq!(programmer.tags().available(), programmer.tags().capacity());
    assert!(h.phys_br.flows().is_empty());
    assert!(h
        .int_br
        .find_flow(|f| f.priority() == Some(PRIORITY_INBOUND))
        .is_none());
}

#[tokio::test]
async fn test_network_outlives_all_but_last_port() {
    let h = Harness::new();
    let ports = h.ports();
    for (name, id, ofport) in [("tap1", "p1", 5), ("tap2", "p2", 6)] {
        h.int_br.add_vif(name, id, ofport);
        h.plugin
            .set_details(details(id, "net-l", NetworkType::Local, None));
    }
    ports.treat_devices_added(&set(&["p1", "p2"])).await.unwrap();
    assert_eq!(h.int_br.port_tag("tap1"), h.int_br.port_tag("tap2"));

    ports.treat_devices_removed(&set(&["p1"])).await.unwrap();
    {
        let programmer = h.programmer.lock().await;
        let binding = programmer.binding("net-l").unwrap();
        assert_eq!(binding.vif_ports.keys().collect::<Vec<_>>(), vec!["p2"]);
    }

    ports.treat_devices_removed(&set(&["p2"])).await.unwrap();
    assert!(h.programmer.lock().await.bindings().is_empty());
    assert_eq!(h.firewall.removed(), vec!["p1", "p2"]);
}

#[tokio::test]
async fn test_flood_flow_reaches_every_tunnel_port() {
    let h = Harness::new();
    let ports = h.ports();
    let tunnels = h.tunnels(vec![TunnelType::Gre]);

    // network first, peers later: the flood flow must follow the peers
    h.int_br.add_vif("tap1", "p1", 5);
    h.plugin.set_details(details(
        "p1",
        "net-t",
        NetworkType::Tunnel(TunnelType::Gre),
        Some(7),
    ));
    ports.treat_devices_added(&set(&["p1"])).await.unwrap();
    assert!(h.tun_br.flows_in_table(FLOOD_TO_TUN).is_empty());

    h.plugin.set_tunnels(
        TunnelType::Gre,
        vec![
            TunnelEndpoint::new("10.0.0.2"),
            TunnelEndpoint::new("10.0.0.3"),
            TunnelEndpoint::new("10.0.0.4"),
            TunnelEndpoint::new(LOCAL_IP),
        ],
    );
    assert!(!tunnels.tunnel_sync().await);

    let programmer = h.programmer.lock().await;
    let tunnel_ports = programmer.tunnel_ofports(TunnelType::Gre);
    assert_eq!(tunnel_ports.len(), 3);

    let floods = h.tun_br.flows_in_table(FLOOD_TO_TUN);
    assert_eq!(floods.len(), 1);
    let flooded: BTreeSet<OfPort> = floods[0].output_ports().into_iter().collect();
    assert_eq!(flooded, tunnel_ports);
    assert_eq!(programmer.binding("net-t").unwrap().tun_ofports, tunnel_ports);
}

#[tokio::test]
async fn test_flood_flow_independent_of_peer_order() {
    let h = Harness::new();
    let ports = h.ports();
    let tunnels = h.tunnels(vec![TunnelType::Gre]);
    h.int_br.add_vif("tap1", "p1", 5);
    h.plugin.set_details(details(
        "p1",
        "net-t",
        NetworkType::Tunnel(TunnelType::Gre),
        Some(7),
    ));

    // one peer before the network exists, one announced after, one from sync
    tunnels
        .tunnel_update("10.0.0.4", None, Some("gre"))
        .await
        .unwrap();
    ports.treat_devices_added(&set(&["p1"])).await.unwrap();
    tunnels
        .tunnel_update("10.0.0.2", None, Some("gre"))
        .await
        .unwrap();
    h.plugin.set_tunnels(
        TunnelType::Gre,
        vec![
            TunnelEndpoint::new("10.0.0.3"),
            TunnelEndpoint::new("10.0.0.2"),
            TunnelEndpoint::new("10.0.0.4"),
        ],
    );
    assert!(!tunnels.tunnel_sync().await);

    let programmer = h.programmer.lock().await;
    let tunnel_ports = programmer.tunnel_ofports(TunnelType::Gre);
    assert_eq!(tunnel_ports.len(), 3);
    let floods = h.tun_br.flows_in_table(FLOOD_TO_TUN);
    assert_eq!(floods.len(), 1);
    let flooded: BTreeSet<OfPort> = floods[0].output_ports().into_iter().collect();
    assert_eq!(flooded, tunnel_ports);
}

#[tokio::test]
async fn test_exhausted_pool_quarantines_port() {
    let h = Harness::with_tags(TagAllocator::new(1, 2));
    let ports = h.ports();
    h.int_br.add_vif("tap1", "p1", 5);
    h.int_br.add_vif("tap2", "p2", 6);
    h.plugin
        .set_details(details("p1", "net-a", NetworkType::Local, None));
    h.plugin
        .set_details(details("p2", "net-b", NetworkType::Local, None));

    // the refused port is retried on the next cycle
    assert!(ports.treat_devices_added(&set(&["p1", "p2"])).await.unwrap());

    {
        let programmer = h.programmer.lock().await;
        assert_eq!(programmer.bindings().len(), 1);
        assert!(programmer.binding("net-b").is_none());
    }
    assert_eq!(h.int_br.port_tag("tap1"), Some(1));
    assert_eq!(h.int_br.port_tag("tap2"), Some(DEAD_VLAN_TAG));
    let drop = h
        .int_br
        .find_flow(|f| f.flow_match().in_port == Some(OfPort::new(6)))
        .unwrap();
    assert_eq!(drop.priority(), Some(PRIORITY_DROP));
    assert_eq!(h.plugin.devices_up(), vec!["p1"]);

    // once net-a is gone the retry binds p2
    h.int_br.remove_vif("p1");
    ports.treat_devices_removed(&set(&["p1"])).await.unwrap();
    assert!(!ports.treat_devices_added(&set(&["p2"])).await.unwrap());
    assert_eq!(h.int_br.port_tag("tap2"), Some(1));
    assert!(h
        .int_br
        .find_flow(|f| f.flow_match().in_port == Some(OfPort::new(6)))
        .is_none());
    assert_eq!(h.plugin.devices_up(), vec!["p1", "p2"]);
}

#[tokio::test]
async fn test_admin_down_update_parks_port() {
    let h = Harness::new();
    let handler = h.notifications();
    h.int_br.add_vif("tap1", "p1", 5);

    handler
        .handle(AgentNotification::PortUpdate {
            port: PortUpdate {
                id: "p1".to_string(),
                network_id: "net-a".to_string(),
                admin_state_up: false,
                security_groups: None,
            },
            network_type: Some(NetworkType::Vlan),
            physical_network: Some("physnet1".to_string()),
            segmentation_id: Some(100),
        })
        .await
        .unwrap();

    assert_eq!(h.int_br.port_tag("tap1"), Some(DEAD_VLAN_TAG));
    let drop = h
        .int_br
        .find_flow(|f| f.priority() == Some(PRIORITY_DROP))
        .unwrap();
    assert!(drop.is_drop());
    assert_eq!(drop.flow_match().in_port, Some(OfPort::new(5)));
    assert!(h.programmer.lock().await.bindings().is_empty());
    assert_eq!(h.plugin.devices_down(), vec!["p1"]);
}

#[tokio::test]
async fn test_failed_lookup_requests_resync_without_blocking_others() {
    let h = Harness::new();
    let ports = h.ports();
    for (name, id, ofport) in [("tap1", "p1", 5), ("tap2", "p2", 6), ("tap3", "p3", 7)] {
        h.int_br.add_vif(name, id, ofport);
        h.plugin
            .set_details(details(id, "net-l", NetworkType::Local, None));
    }
    h.plugin.fail_device("p2");

    assert!(ports
        .treat_devices_added(&set(&["p1", "p2", "p3"]))
        .await
        .unwrap());

    let programmer = h.programmer.lock().await;
    let bound: BTreeSet<&String> = programmer
        .binding("net-l")
        .unwrap()
        .vif_ports
        .keys()
        .collect();
    assert_eq!(bound.into_iter().cloned().collect::<PortSet>(), set(&["p1", "p3"]));
    assert_eq!(h.plugin.devices_up(), vec!["p1", "p3"]);
    assert_eq!(h.int_br.port_tag("tap2"), None);
}

#[tokio::test]
async fn test_network_delete_reclaims_tag() {
    let h = Harness::new();
    let ports = h.ports();
    let handler = h.notifications();
    h.int_br.add_vif("tap1", "p1", 5);
    h.plugin
        .set_details(details("p1", "net-a", NetworkType::Vlan, Some(100)));
    ports.treat_devices_added(&set(&["p1"])).await.unwrap();

    handler
        .handle(AgentNotification::NetworkDelete {
            network_id: "net-a".to_string(),
        })
        .await
        .unwrap();

    let programmer = h.programmer.lock().await;
    assert!(programmer.bindings().is_empty());
    assert_eq!(programmer.tags().available(), programmer.tags().capacity());
    assert!(h.phys_br.flows().is_empty());
}
