//! Tunnel peer discovery.

use std::sync::Arc;

use ofagent_common::AgentResult;
use ofagent_types::{OfPort, TunnelType};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::flow_programmer::FlowProgrammer;
use crate::plugin_rpc::{PluginApi, TunnelEndpoint, TunnelId};

/// Canonical tunnel port name: `<type>-<peer id or address>`.
pub fn tunnel_port_name(tunnel_type: TunnelType, peer: &str) -> String {
    format!("{}-{}", tunnel_type, peer)
}

/// Keeps one tunnel port per known remote endpoint and tunnel type.
pub struct TunnelReconciler {
    programmer: Arc<Mutex<FlowProgrammer>>,
    plugin: Arc<dyn PluginApi>,
    local_ip: String,
    tunnel_types: Vec<TunnelType>,
}

impl TunnelReconciler {
    pub fn new(
        programmer: Arc<Mutex<FlowProgrammer>>,
        plugin: Arc<dyn PluginApi>,
        local_ip: impl Into<String>,
        tunnel_types: Vec<TunnelType>,
    ) -> Self {
        Self {
            programmer,
            plugin,
            local_ip: local_ip.into(),
            tunnel_types,
        }
    }

    /// Tunneling is on when at least one tunnel type is configured.
    pub fn enabled(&self) -> bool {
        !self.tunnel_types.is_empty()
    }

    pub fn tunnel_types(&self) -> &[TunnelType] {
        &self.tunnel_types
    }

    /// Creates the tunnel port to `remote_ip` unless it already exists.
    async fn ensure_tunnel_port(
        &self,
        remote_ip: &str,
        peer: &str,
        tunnel_type: TunnelType,
    ) -> AgentResult<Option<OfPort>> {
        let mut programmer = self.programmer.lock().await;
        if let Some(existing) = programmer.tunnel_port(tunnel_type, remote_ip) {
            return Ok(Some(existing.ofport));
        }
        programmer
            .setup_tunnel_port(&tunnel_port_name(tunnel_type, peer), remote_ip, tunnel_type)
            .await
    }

    /// Removes tunnel ports of `tunnel_type` whose peer is no longer known.
    async fn retire_stale_peers(&self, tunnel_type: TunnelType, known: &[TunnelEndpoint]) -> bool {
        let mut resync = false;
        let mut programmer = self.programmer.lock().await;
        for remote_ip in programmer.tunnel_peers(tunnel_type) {
            if known.iter().any(|t| t.ip_address == remote_ip) {
                continue;
            }
            info!("Tunnel peer {} gone, removing {} port", remote_ip, tunnel_type);
            if let Err(e) = programmer.retire_tunnel_peer(tunnel_type, &remote_ip).await {
                debug!("Unable to remove tunnel to {}: {}", remote_ip, e);
                resync = true;
            }
        }
        resync
    }

    /// Pulls the authoritative peer list for every tunnel type, creates the
    /// missing ports and removes the ones whose peer disappeared. Returns
    /// true when the sync must be retried.
    pub async fn tunnel_sync(&self) -> bool {
        let mut resync = false;
        for &tunnel_type in &self.tunnel_types {
            let reply = match self.plugin.tunnel_sync(&self.local_ip, tunnel_type).await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("Unable to sync tunnel IP {}: {}", self.local_ip, e);
                    resync = true;
                    continue;
                }
            };
            for tunnel in &reply.tunnels {
                if tunnel.ip_address == self.local_ip {
                    continue;
                }
                if let Err(e) = self
                    .ensure_tunnel_port(&tunnel.ip_address, &tunnel.port_suffix(), tunnel_type)
                    .await
                {
                    debug!("Unable to set up tunnel to {}: {}", tunnel.ip_address, e);
                    resync = true;
                }
            }
            resync |= self.retire_stale_peers(tunnel_type, &reply.tunnels).await;
        }
        resync
    }

    /// Handles a peer announced by the control plane.
    pub async fn tunnel_update(
        &self,
        tunnel_ip: &str,
        tunnel_id: Option<&TunnelId>,
        tunnel_type: Option<&str>,
    ) -> AgentResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        let Some(tunnel_type) = tunnel_type else {
            error!("No tunnel_type specified, cannot create tunnels");
            return Ok(());
        };
        let tunnel_type = match tunnel_type.parse::<TunnelType>() {
            Ok(t) if self.tunnel_types.contains(&t) => t,
            _ => {
                error!("tunnel_type {} not supported by agent", tunnel_type);
                return Ok(());
            }
        };
        if tunnel_ip == self.local_ip {
            return Ok(());
        }

        let peer = tunnel_id
            .map(TunnelId::to_string)
            .unwrap_or_else(|| tunnel_ip.to_string());
        info!("Tunnel update: {} {} {}", tunnel_type, tunnel_ip, peer);
        self.ensure_tunnel_port(tunnel_ip, &peer, tunnel_type)
            .await?;
        Ok(())
    }
}
