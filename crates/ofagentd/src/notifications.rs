//! Inbound control-plane notifications.
//!
//! Notifications arrive out of band with the reconciliation loop and are
//! applied by a single dispatcher task under the shared programmer lock.

use std::sync::Arc;
use std::time::Duration;

use ofagent_common::AgentResult;
use ofagent_types::NetworkType;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::binding::PortBinding;
use crate::flow_programmer::FlowProgrammer;
use crate::plugin_rpc::{HttpPluginClient, PluginApi, TunnelId};
use crate::security_group::SecurityGroupGate;
use crate::tunnel_reconciler::TunnelReconciler;

/// Port attributes carried by a `port_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortUpdate {
    pub id: String,
    pub network_id: String,
    #[serde(default)]
    pub admin_state_up: bool,
    /// Present when the port's security groups changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AgentNotification {
    NetworkDelete {
        network_id: String,
    },
    PortUpdate {
        port: PortUpdate,
        #[serde(default)]
        network_type: Option<NetworkType>,
        #[serde(default)]
        physical_network: Option<String>,
        #[serde(default)]
        segmentation_id: Option<u32>,
    },
    TunnelUpdate {
        tunnel_ip: String,
        #[serde(default)]
        tunnel_id: Option<TunnelId>,
        #[serde(default)]
        tunnel_type: Option<String>,
    },
    SecurityGroupsChanged,
}

pub struct NotificationHandler {
    programmer: Arc<Mutex<FlowProgrammer>>,
    plugin: Arc<dyn PluginApi>,
    firewall: Arc<dyn SecurityGroupGate>,
    tunnels: Arc<TunnelReconciler>,
    agent_id: String,
    host: String,
}

impl NotificationHandler {
    pub fn new(
        programmer: Arc<Mutex<FlowProgrammer>>,
        plugin: Arc<dyn PluginApi>,
        firewall: Arc<dyn SecurityGroupGate>,
        tunnels: Arc<TunnelReconciler>,
        agent_id: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            programmer,
            plugin,
            firewall,
            tunnels,
            agent_id: agent_id.into(),
            host: host.into(),
        }
    }

    pub async fn handle(&self, notification: AgentNotification) -> AgentResult<()> {
        match notification {
            AgentNotification::NetworkDelete { network_id } => {
                self.network_delete(&network_id).await
            }
            AgentNotification::PortUpdate {
                port,
                network_type,
                physical_network,
                segmentation_id,
            } => {
                self.port_update(port, network_type, physical_network, segmentation_id)
                    .await
            }
            AgentNotification::TunnelUpdate {
                tunnel_ip,
                tunnel_id,
                tunnel_type,
            } => {
                self.tunnels
                    .tunnel_update(&tunnel_ip, tunnel_id.as_ref(), tunnel_type.as_deref())
                    .await
            }
            AgentNotification::SecurityGroupsChanged => {
                self.firewall.refresh_firewall().await;
                Ok(())
            }
        }
    }

    async fn network_delete(&self, network_id: &str) -> AgentResult<()> {
        debug!("network_delete received");
        let mut programmer = self.programmer.lock().await;
        if programmer.binding(network_id).is_some() {
            programmer.reclaim_local_vlan(network_id).await?;
        } else {
            debug!("Network {} not used on agent.", network_id);
        }
        Ok(())
    }

    async fn port_update(
        &self,
        port: PortUpdate,
        network_type: Option<NetworkType>,
        physical_network: Option<String>,
        segmentation_id: Option<u32>,
    ) -> AgentResult<()> {
        debug!("port_update received");
        let mut programmer = self.programmer.lock().await;
        let int_br = programmer.int_br().clone();
        let Some(vif_port) = int_br.vif_port_by_id(&port.id).await? else {
            return Ok(());
        };

        if port.security_groups.is_some() {
            self.firewall.refresh_firewall().await;
        }

        let binding = PortBinding {
            port_id: port.id.clone(),
            network_id: port.network_id.clone(),
            network_type: network_type.unwrap_or(NetworkType::Local),
            physical_network,
            segmentation_id,
            admin_state_up: port.admin_state_up,
        };
        let bound = programmer.treat_vif_port(Some(&vif_port), &binding).await?;
        drop(programmer);
        if !bound {
            warn!(
                "Port {} quarantined, no local vlan available for net-id={}",
                port.id, port.network_id
            );
            return Ok(());
        }

        let result = if port.admin_state_up {
            self.plugin
                .update_device_up(&port.id, &self.agent_id, &self.host)
                .await
        } else {
            self.plugin
                .update_device_down(&port.id, &self.agent_id, &self.host)
                .await
                .map(|_| ())
        };
        if let Err(e) = result {
            error!("RPC error while updating port {}: {}", port.id, e);
        }
        Ok(())
    }
}

/// Applies notifications in arrival order until the channel closes.
pub fn spawn_dispatcher(
    handler: Arc<NotificationHandler>,
    mut rx: mpsc::Receiver<AgentNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(e) = handler.handle(notification).await {
                warn!("Notification handling failed: {}", e);
            }
        }
        info!("Notification channel closed");
    })
}

/// Polls the control plane for queued notifications and forwards them to
/// the dispatcher.
pub fn spawn_notification_poller(
    client: Arc<HttpPluginClient>,
    agent_id: String,
    host: String,
    tx: mpsc::Sender<AgentNotification>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let notifications = match client.fetch_notifications(&agent_id, &host).await {
                Ok(n) => n,
                Err(e) => {
                    debug!("Notification poll failed: {}", e);
                    continue;
                }
            };
            for notification in notifications {
                if tx.send(notification).await.is_err() {
                    info!("Dispatcher gone, stopping notification poller");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingFirewall, SimBridge, SimPluginClient};
    use crate::tag_allocator::TagAllocator;
    use ofagent_types::{OfPort, DEAD_VLAN_TAG};
    use pretty_assertions::assert_eq;

    struct Fixture {
        int_br: Arc<SimBridge>,
        plugin: Arc<SimPluginClient>,
        firewall: Arc<RecordingFirewall>,
        programmer: Arc<Mutex<FlowProgrammer>>,
        handler: NotificationHandler,
    }

    fn fixture() -> Fixture {
        fixture_with_tags(TagAllocator::default())
    }

    fn fixture_with_tags(tags: TagAllocator) -> Fixture {
        let int_br = SimBridge::shared("br-int");
        let plugin = SimPluginClient::shared();
        let firewall = RecordingFirewall::shared();
        let programmer = Arc::new(Mutex::new(
            FlowProgrammer::new(int_br.clone()).with_tag_allocator(tags),
        ));
        let tunnels = Arc::new(TunnelReconciler::new(
            programmer.clone(),
            plugin.clone(),
            "10.0.0.1",
            Vec::new(),
        ));
        let handler = NotificationHandler::new(
            programmer.clone(),
            plugin.clone(),
            firewall.clone(),
            tunnels,
            "ovs020000000001",
            "compute-1",
        );
        Fixture {
            int_br,
            plugin,
            firewall,
            programmer,
            handler,
        }
    }

    fn port_update(id: &str, up: bool, groups: Option<Vec<String>>) -> AgentNotification {
        AgentNotification::PortUpdate {
            port: PortUpdate {
                id: id.to_string(),
                network_id: "net-a".to_string(),
                admin_state_up: up,
                security_groups: groups,
            },
            network_type: Some(NetworkType::Local),
            physical_network: None,
            segmentation_id: None,
        }
    }

    #[test]
    fn test_notification_wire_format() {
        let n: AgentNotification = serde_json::from_str(
            r#"{"method":"tunnel_update","tunnel_ip":"10.0.0.2","tunnel_type":"gre"}"#,
        )
        .unwrap();
        assert_eq!(
            n,
            AgentNotification::TunnelUpdate {
                tunnel_ip: "10.0.0.2".to_string(),
                tunnel_id: None,
                tunnel_type: Some("gre".to_string()),
            }
        );

        let n: AgentNotification = serde_json::from_str(
            r#"{"method":"port_update","port":{"id":"p1","network_id":"n1","admin_state_up":true},
                "network_type":"vlan","physical_network":"physnet1","segmentation_id":100}"#,
        )
        .unwrap();
        assert!(matches!(
            n,
            AgentNotification::PortUpdate {
                network_type: Some(NetworkType::Vlan),
                segmentation_id: Some(100),
                ..
            }
        ));

        let n: AgentNotification =
            serde_json::from_str(r#"{"method":"security_groups_changed"}"#).unwrap();
        assert_eq!(n, AgentNotification::SecurityGroupsChanged);
    }

    #[tokio::test]
    async fn test_port_update_binds_and_reports_up() {
        let f = fixture();
        f.int_br.add_vif("tap1", "p1", 5);
        f.handler
            .handle(port_update("p1", true, Some(vec!["sg-1".to_string()])))
            .await
            .unwrap();

        assert!(f.programmer.lock().await.binding("net-a").is_some());
        assert_eq!(f.plugin.devices_up(), vec!["p1"]);
        assert_eq!(f.firewall.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_port_update_without_free_vlan_is_not_reported_up() {
        let f = fixture_with_tags(TagAllocator::new(1, 1));
        f.int_br.add_vif("tap1", "p1", 5);
        f.handler.handle(port_update("p1", true, None)).await.unwrap();

        assert_eq!(f.int_br.port_tag("tap1"), Some(DEAD_VLAN_TAG));
        assert!(f.int_br.flows()[0].is_drop());
        assert!(f.programmer.lock().await.bindings().is_empty());
        assert!(f.plugin.devices_up().is_empty());
        assert!(f.plugin.devices_down().is_empty());
    }

    #[tokio::test]
    async fn test_port_update_admin_down_quarantines() {
        let f = fixture();
        f.int_br.add_vif("tap1", "p1", 5);
        f.handler.handle(port_update("p1", false, None)).await.unwrap();

        assert_eq!(f.int_br.port_tag("tap1"), Some(DEAD_VLAN_TAG));
        let drop = f.int_br.flows();
        assert_eq!(drop.len(), 1);
        assert!(drop[0].is_drop());
        assert_eq!(drop[0].flow_match().in_port, Some(OfPort::new(5)));
        assert!(f.programmer.lock().await.bindings().is_empty());
        assert_eq!(f.plugin.devices_down(), vec!["p1"]);
        assert_eq!(f.firewall.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_port_update_for_foreign_port_is_ignored() {
        let f = fixture();
        f.handler.handle(port_update("p9", true, None)).await.unwrap();
        assert!(f.plugin.devices_up().is_empty());
        assert!(f.programmer.lock().await.bindings().is_empty());
    }

    #[tokio::test]
    async fn test_network_delete() {
        let f = fixture();
        f.int_br.add_vif("tap1", "p1", 5);
        f.handler.handle(port_update("p1", true, None)).await.unwrap();

        f.handler
            .handle(AgentNotification::NetworkDelete {
                network_id: "net-a".to_string(),
            })
            .await
            .unwrap();
        let programmer = f.programmer.lock().await;
        assert!(programmer.bindings().is_empty());
        assert_eq!(programmer.tags().available(), programmer.tags().capacity());
    }

    #[tokio::test]
    async fn test_dispatcher_drains_channel() {
        let f = fixture();
        f.int_br.add_vif("tap1", "p1", 5);
        let firewall = f.firewall.clone();
        let plugin = f.plugin.clone();
        let (tx, rx) = mpsc::channel(8);
        let task = spawn_dispatcher(Arc::new(f.handler), rx);

        tx.send(port_update("p1", true, None)).await.unwrap();
        tx.send(AgentNotification::SecurityGroupsChanged).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(plugin.devices_up(), vec!["p1"]);
        assert_eq!(firewall.refreshes(), 1);
    }
}
