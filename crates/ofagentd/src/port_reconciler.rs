//! Port-set diffing and per-port binding.

use std::collections::BTreeSet;
use std::sync::Arc;

use ofagent_common::AgentResult;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::flow_programmer::FlowProgrammer;
use crate::plugin_rpc::PluginApi;
use crate::security_group::SecurityGroupGate;

/// Interface ids of the ports seen on a set of bridges.
pub type PortSet = BTreeSet<String>;

/// Result of comparing the live port set against the remembered one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDelta {
    pub current: PortSet,
    pub added: PortSet,
    pub removed: PortSet,
}

/// Returns `None` when nothing changed.
pub fn diff_ports(live: &PortSet, known: &PortSet) -> Option<PortDelta> {
    if live == known {
        return None;
    }
    Some(PortDelta {
        current: live.clone(),
        added: live.difference(known).cloned().collect(),
        removed: known.difference(live).cloned().collect(),
    })
}

/// Applies port deltas: binds added ports, unbinds removed ones, and keeps
/// the control plane informed of their state.
///
/// Every `treat_*` method returns whether the cycle needs a full resync.
pub struct PortReconciler {
    programmer: Arc<Mutex<FlowProgrammer>>,
    plugin: Arc<dyn PluginApi>,
    firewall: Arc<dyn SecurityGroupGate>,
    agent_id: String,
    host: String,
}

impl PortReconciler {
    pub fn new(
        programmer: Arc<Mutex<FlowProgrammer>>,
        plugin: Arc<dyn PluginApi>,
        firewall: Arc<dyn SecurityGroupGate>,
        agent_id: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            programmer,
            plugin,
            firewall,
            agent_id: agent_id.into(),
            host: host.into(),
        }
    }

    pub fn programmer(&self) -> &Arc<Mutex<FlowProgrammer>> {
        &self.programmer
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Live VM ports on the integration bridge.
    pub async fn scan_ports(&self) -> AgentResult<PortSet> {
        let int_br = self.programmer.lock().await.int_br().clone();
        int_br.vif_port_set().await
    }

    /// Reports a port's state after binding; failures are logged only.
    async fn report_port_state(&self, device: &str, admin_state_up: bool) {
        let result = if admin_state_up {
            self.plugin
                .update_device_up(device, &self.agent_id, &self.host)
                .await
        } else {
            self.plugin
                .update_device_down(device, &self.agent_id, &self.host)
                .await
                .map(|_| ())
        };
        if let Err(e) = result {
            if e.is_retryable() {
                debug!("Status report for {} failed: {}", device, e);
            } else {
                warn!("Status report for {} failed: {}", device, e);
            }
        }
    }

    pub async fn treat_devices_added(&self, devices: &PortSet) -> AgentResult<bool> {
        let mut resync = false;
        let list: Vec<String> = devices.iter().cloned().collect();
        self.firewall.prepare_devices_filter(&list).await;

        for device in devices {
            debug!("Port {} added", device);
            let details = match self.plugin.get_device_details(device, &self.agent_id).await {
                Ok(details) => details,
                Err(e) => {
                    debug!("Unable to get port details for {}: {}", device, e);
                    resync = true;
                    continue;
                }
            };

            let mut programmer = self.programmer.lock().await;
            let int_br = programmer.int_br().clone();
            let vif_port = int_br.vif_port_by_id(device).await?;

            match details.binding() {
                Some(binding) => {
                    info!("Port {} updated. Details: {:?}", device, details);
                    let bound = programmer
                        .treat_vif_port(vif_port.as_ref(), &binding)
                        .await?;
                    drop(programmer);
                    if !bound {
                        warn!("Port {} quarantined, no local vlan available", device);
                        resync = true;
                        continue;
                    }
                    self.report_port_state(device, binding.admin_state_up).await;
                }
                None => {
                    debug!("Device {} not defined on plugin", device);
                    if let Some(port) = vif_port.filter(|p| p.ofport.is_valid()) {
                        programmer.port_dead(&port).await?;
                    }
                }
            }
        }
        Ok(resync)
    }

    pub async fn treat_devices_removed(&self, devices: &PortSet) -> AgentResult<bool> {
        let mut resync = false;
        let list: Vec<String> = devices.iter().cloned().collect();
        self.firewall.remove_devices_filter(&list).await;

        for device in devices {
            info!("Attachment {} removed", device);
            match self
                .plugin
                .update_device_down(device, &self.agent_id, &self.host)
                .await
            {
                Ok(reply) => {
                    if reply.exists {
                        debug!("Port {} updated", device);
                    } else {
                        debug!("Device {} not defined on plugin", device);
                    }
                }
                Err(e) => {
                    debug!("port_removed failed for {}: {}", device, e);
                    resync = true;
                    continue;
                }
            }
            self.programmer.lock().await.port_unbound(device, None).await?;
        }
        Ok(resync)
    }

    /// Ports on ancillary bridges only get their status reported.
    pub async fn treat_ancillary_devices_added(&self, devices: &PortSet) -> bool {
        let mut resync = false;
        for device in devices {
            info!("Ancillary Port {} added", device);
            if let Err(e) = self.plugin.get_device_details(device, &self.agent_id).await {
                debug!("Unable to get port details for {}: {}", device, e);
                resync = true;
                continue;
            }
            // no binding on ancillary bridges, just report the port up
            if let Err(e) = self
                .plugin
                .update_device_up(device, &self.agent_id, &self.host)
                .await
            {
                debug!("update_device_up failed for {}: {}", device, e);
            }
        }
        resync
    }

    pub async fn treat_ancillary_devices_removed(&self, devices: &PortSet) -> bool {
        let mut resync = false;
        for device in devices {
            info!("Attachment {} removed", device);
            match self
                .plugin
                .update_device_down(device, &self.agent_id, &self.host)
                .await
            {
                Ok(reply) if reply.exists => debug!("Port {} updated", device),
                Ok(_) => debug!("Device {} not defined on plugin", device),
                Err(e) => {
                    debug!("port_removed failed for {}: {}", device, e);
                    resync = true;
                }
            }
        }
        resync
    }
}
