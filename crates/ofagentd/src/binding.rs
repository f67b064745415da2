//! Live mapping of a logical network to its local tag.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use ofagent_types::{NetworkType, OfPort, VifPort};

/// One logical network as provisioned on this host.
///
/// Exists exactly while its tag is allocated; dropped with the last port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    /// Local tag.
    pub vlan: u16,
    pub network_type: NetworkType,
    pub physical_network: Option<String>,
    /// VLAN id for `vlan` networks, tunnel key for tunnel networks.
    pub segmentation_id: Option<u32>,
    /// Bound VM ports keyed by interface id.
    pub vif_ports: HashMap<String, VifPort>,
    /// Tunnel ports the network currently floods to.
    pub tun_ofports: BTreeSet<OfPort>,
}

impl NetworkBinding {
    pub fn new(
        vlan: u16,
        network_type: NetworkType,
        physical_network: Option<String>,
        segmentation_id: Option<u32>,
    ) -> Self {
        Self {
            vlan,
            network_type,
            physical_network,
            segmentation_id,
            vif_ports: HashMap::new(),
            tun_ofports: BTreeSet::new(),
        }
    }
}

impl fmt::Display for NetworkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lv-id = {} type = {} phys-net = {} phys-id = {}",
            self.vlan,
            self.network_type,
            self.physical_network.as_deref().unwrap_or("None"),
            self.segmentation_id
                .map(|s| s.to_string())
                .unwrap_or_else(|| "None".to_string())
        )
    }
}

/// Network attributes of a port as reported by the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub port_id: String,
    pub network_id: String,
    pub network_type: NetworkType,
    pub physical_network: Option<String>,
    pub segmentation_id: Option<u32>,
    pub admin_state_up: bool,
}
