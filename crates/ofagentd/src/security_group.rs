//! Security-group firewall seam.
//!
//! The firewall itself lives outside the agent; the reconciliation engine
//! only tells it which devices appeared, disappeared or need a refresh.

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait SecurityGroupGate: Send + Sync {
    async fn prepare_devices_filter(&self, devices: &[String]);

    async fn remove_devices_filter(&self, devices: &[String]);

    async fn refresh_firewall(&self);
}

/// Gate used when no firewall driver is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFirewall;

#[async_trait]
impl SecurityGroupGate for NoopFirewall {
    async fn prepare_devices_filter(&self, devices: &[String]) {
        debug!("Firewall disabled, skipping filters for {} devices", devices.len());
    }

    async fn remove_devices_filter(&self, devices: &[String]) {
        debug!("Firewall disabled, nothing to remove for {} devices", devices.len());
    }

    async fn refresh_firewall(&self) {
        debug!("Firewall disabled, refresh ignored");
    }
}
