//! The reconciliation loop.
//!
//! Each cycle optionally resyncs tunnels, rescans the switch when the
//! polling manager asks for it, and applies the port deltas. Errors never
//! end the loop; they force a full resync on the next cycle.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ofagent_common::AgentResult;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::polling::PollingManager;
use crate::port_reconciler::{diff_ports, PortDelta, PortReconciler, PortSet};
use crate::tunnel_reconciler::TunnelReconciler;

/// State carried from one cycle to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub sync: bool,
    pub tunnel_sync: bool,
    pub ports: PortSet,
    pub ancillary_ports: PortSet,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            sync: true,
            tunnel_sync: true,
            ports: PortSet::new(),
            ancillary_ports: PortSet::new(),
        }
    }
}

/// Processed ports statistics of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub regular_added: usize,
    pub regular_removed: usize,
    pub ancillary_added: usize,
    pub ancillary_removed: usize,
}

impl fmt::Display for PortStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "regular: added={} removed={}, ancillary: added={} removed={}",
            self.regular_added, self.regular_removed, self.ancillary_added, self.ancillary_removed
        )
    }
}

/// Time left in the polling interval, or `None` when the cycle overran it.
pub fn pace(elapsed: Duration, interval: Duration) -> Option<Duration> {
    if elapsed < interval {
        Some(interval - elapsed)
    } else {
        warn!(
            "Loop iteration exceeded interval ({:?} vs. {:?})!",
            interval, elapsed
        );
        None
    }
}

pub struct Agent {
    ports: PortReconciler,
    tunnels: Arc<TunnelReconciler>,
    ancillary_brs: Vec<Arc<dyn Bridge>>,
    device_count: watch::Sender<usize>,
    polling_interval: Duration,
    iter_num: u64,
}

impl Agent {
    pub fn new(
        ports: PortReconciler,
        tunnels: Arc<TunnelReconciler>,
        polling_interval: Duration,
    ) -> Self {
        let (device_count, _) = watch::channel(0);
        Self {
            ports,
            tunnels,
            ancillary_brs: Vec::new(),
            device_count,
            polling_interval,
            iter_num: 0,
        }
    }

    pub fn with_ancillary_bridges(mut self, bridges: Vec<Arc<dyn Bridge>>) -> Self {
        self.ancillary_brs = bridges;
        self
    }

    /// Number of VM ports on the integration bridge, updated on every change.
    pub fn device_count(&self) -> watch::Receiver<usize> {
        self.device_count.subscribe()
    }

    pub fn iter_num(&self) -> u64 {
        self.iter_num
    }

    pub fn port_reconciler(&self) -> &PortReconciler {
        &self.ports
    }

    pub async fn update_ports(&self, registered: &PortSet) -> AgentResult<Option<PortDelta>> {
        let live = self.ports.scan_ports().await?;
        let delta = diff_ports(&live, registered);
        if delta.is_some() {
            self.device_count.send_replace(live.len());
        }
        Ok(delta)
    }

    pub async fn update_ancillary_ports(
        &self,
        registered: &PortSet,
    ) -> AgentResult<Option<PortDelta>> {
        let mut live = PortSet::new();
        for bridge in &self.ancillary_brs {
            live.extend(bridge.vif_port_set().await?);
        }
        Ok(diff_ports(&live, registered))
    }

    async fn process_network_ports(&self, delta: &PortDelta) -> AgentResult<bool> {
        let start = Instant::now();
        let resync_added = self.ports.treat_devices_added(&delta.added).await?;
        debug!(
            "process_network_ports - iteration:{} - treat_devices_added completed in {:?}",
            self.iter_num,
            start.elapsed()
        );

        let start = Instant::now();
        let resync_removed = self.ports.treat_devices_removed(&delta.removed).await?;
        debug!(
            "process_network_ports - iteration:{} - treat_devices_removed completed in {:?}",
            self.iter_num,
            start.elapsed()
        );
        Ok(resync_added || resync_removed)
    }

    async fn process_ancillary_network_ports(&self, delta: &PortDelta) -> bool {
        let start = Instant::now();
        let resync_added = self
            .ports
            .treat_ancillary_devices_added(&delta.added)
            .await;
        debug!(
            "process_ancillary_network_ports - iteration:{} - treat_ancillary_devices_added completed in {:?}",
            self.iter_num,
            start.elapsed()
        );

        let start = Instant::now();
        let resync_removed = self
            .ports
            .treat_ancillary_devices_removed(&delta.removed)
            .await;
        debug!(
            "process_ancillary_network_ports - iteration:{} - treat_ancillary_devices_removed completed in {:?}",
            self.iter_num,
            start.elapsed()
        );
        resync_added || resync_removed
    }

    async fn process_iteration(
        &self,
        state: &mut LoopState,
        polling: &mut dyn PollingManager,
        stats: &mut PortStats,
    ) -> AgentResult<()> {
        let start = Instant::now();

        if self.tunnels.enabled() && state.tunnel_sync {
            info!("Agent tunnel out of sync with plugin!");
            state.tunnel_sync = self.tunnels.tunnel_sync().await;
        }

        if !polling.is_polling_required() {
            return Ok(());
        }
        debug!(
            "Agent rpc_loop - iteration:{} - starting polling. Elapsed:{:?}",
            self.iter_num,
            start.elapsed()
        );

        if let Some(delta) = self.update_ports(&state.ports).await? {
            debug!("Agent loop has new devices!");
            let resync = self.process_network_ports(&delta).await?;
            debug!(
                "Agent rpc_loop - iteration:{} - ports processed. Elapsed:{:?}",
                self.iter_num,
                start.elapsed()
            );
            stats.regular_added = delta.added.len();
            stats.regular_removed = delta.removed.len();
            state.ports = delta.current;
            state.sync |= resync;
        }

        if !self.ancillary_brs.is_empty() {
            if let Some(delta) = self.update_ancillary_ports(&state.ancillary_ports).await? {
                let resync = self.process_ancillary_network_ports(&delta).await;
                debug!(
                    "Agent rpc_loop - iteration:{} - ancillary ports processed. Elapsed:{:?}",
                    self.iter_num,
                    start.elapsed()
                );
                stats.ancillary_added = delta.added.len();
                stats.ancillary_removed = delta.removed.len();
                state.ancillary_ports = delta.current;
                state.sync |= resync;
            }
        }

        polling.polling_completed();
        Ok(())
    }

    /// Runs one cycle. Never fails: errors are logged and force a full
    /// resync of ports and tunnels on the next cycle.
    pub async fn run_iteration(
        &mut self,
        state: &mut LoopState,
        polling: &mut dyn PollingManager,
    ) -> PortStats {
        let mut stats = PortStats::default();
        debug!("Agent rpc_loop - iteration:{} started", self.iter_num);

        if state.sync {
            info!("Agent out of sync with plugin!");
            state.ports.clear();
            state.ancillary_ports.clear();
            state.sync = false;
            polling.force_polling();
        }

        if let Err(e) = self.process_iteration(state, polling, &mut stats).await {
            error!("Error in agent event loop: {}", e);
            state.sync = true;
            state.tunnel_sync = true;
        }
        stats
    }

    /// Runs cycles until the process exits.
    pub async fn rpc_loop(&mut self, polling: &mut dyn PollingManager) {
        let mut state = LoopState::default();
        loop {
            let start = Instant::now();
            let stats = self.run_iteration(&mut state, polling).await;

            let elapsed = start.elapsed();
            debug!(
                "Agent rpc_loop - iteration:{} completed. Processed ports statistics: {}. Elapsed:{:?}",
                self.iter_num, stats, elapsed
            );
            if let Some(remaining) = pace(elapsed, self.polling_interval) {
                tokio::time::sleep(remaining).await;
            }
            self.iter_num += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_programmer::FlowProgrammer;
    use crate::plugin_rpc::DeviceDetails;
    use crate::polling::{AlwaysPoll, PollingState};
    use crate::sim::{RecordingFirewall, SimBridge, SimPluginClient};
    use ofagent_types::{NetworkType, TunnelType};
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    struct Fixture {
        int_br: Arc<SimBridge>,
        plugin: Arc<SimPluginClient>,
        agent: Agent,
    }

    fn fixture(tunnel_types: Vec<TunnelType>) -> Fixture {
        let int_br = SimBridge::shared("br-int");
        let plugin = SimPluginClient::shared();
        let programmer = Arc::new(Mutex::new(
            FlowProgrammer::new(int_br.clone()).with_tunneling(
                SimBridge::shared("br-tun"),
                "10.0.0.1",
                4789,
            ),
        ));
        let ports = PortReconciler::new(
            programmer.clone(),
            plugin.clone(),
            RecordingFirewall::shared(),
            "ovs020000000001",
            "compute-1",
        );
        let tunnels = Arc::new(TunnelReconciler::new(
            programmer,
            plugin.clone(),
            "10.0.0.1",
            tunnel_types,
        ));
        Fixture {
            int_br,
            plugin,
            agent: Agent::new(ports, tunnels, Duration::from_secs(2)),
        }
    }

    fn local_details(device: &str) -> DeviceDetails {
        DeviceDetails {
            device: device.to_string(),
            port_id: Some(device.to_string()),
            network_id: Some("net-a".to_string()),
            network_type: Some(NetworkType::Local),
            admin_state_up: true,
            ..Default::default()
        }
    }

    /// Never reports updates; only forced or incomplete polls go through.
    #[derive(Default)]
    struct Quiet {
        state: PollingState,
    }

    impl PollingManager for Quiet {
        fn state(&mut self) -> &mut PollingState {
            &mut self.state
        }

        fn updates_pending(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn test_pace() {
        assert_eq!(
            pace(Duration::from_millis(500), Duration::from_secs(2)),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(pace(Duration::from_secs(3), Duration::from_secs(2)), None);
        assert_eq!(pace(Duration::from_secs(2), Duration::from_secs(2)), None);
    }

    #[test]
    fn test_port_stats_display() {
        let stats = PortStats {
            regular_added: 2,
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "regular: added=2 removed=0, ancillary: added=0 removed=0"
        );
    }

    #[tokio::test]
    async fn test_first_iteration_binds_ports() {
        let mut f = fixture(Vec::new());
        f.int_br.add_vif("tap1", "p1", 5);
        f.plugin.set_details(local_details("p1"));
        let devices = f.agent.device_count();

        let mut state = LoopState::default();
        let mut polling = AlwaysPoll::default();
        let stats = f.agent.run_iteration(&mut state, &mut polling).await;

        assert_eq!(stats.regular_added, 1);
        assert!(!state.sync);
        assert_eq!(state.ports.len(), 1);
        assert_eq!(*devices.borrow(), 1);
        assert_eq!(f.plugin.devices_up(), vec!["p1"]);

        // unchanged port set: nothing processed
        let stats = f.agent.run_iteration(&mut state, &mut polling).await;
        assert_eq!(stats, PortStats::default());
        assert_eq!(f.plugin.devices_up().len(), 1);
    }

    #[tokio::test]
    async fn test_removed_port_unbinds() {
        let mut f = fixture(Vec::new());
        f.int_br.add_vif("tap1", "p1", 5);
        f.plugin.set_details(local_details("p1"));
        let mut state = LoopState::default();
        let mut polling = AlwaysPoll::default();
        f.agent.run_iteration(&mut state, &mut polling).await;

        f.int_br.remove_vif("p1");
        let stats = f.agent.run_iteration(&mut state, &mut polling).await;
        assert_eq!(stats.regular_removed, 1);
        assert!(state.ports.is_empty());
        assert!(f
            .agent
            .port_reconciler()
            .programmer()
            .lock()
            .await
            .bindings()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_sets_sync() {
        let mut f = fixture(Vec::new());
        f.int_br.add_vif("tap1", "p1", 5);
        f.plugin.fail_device("p1");
        let mut state = LoopState::default();
        let mut polling = AlwaysPoll::default();

        f.agent.run_iteration(&mut state, &mut polling).await;
        assert!(state.sync);
        assert_eq!(state.ports.len(), 1);

        // the next cycle starts from scratch and sees the port as new again
        f.plugin.set_details(local_details("p1"));
        let stats = f.agent.run_iteration(&mut state, &mut polling).await;
        assert_eq!(stats.regular_added, 1);
        assert!(!state.sync);
    }

    #[tokio::test]
    async fn test_tunnel_sync_flag() {
        let mut f = fixture(vec![TunnelType::Gre]);
        f.plugin.set_fail_tunnel_sync(true);
        let mut state = LoopState::default();
        let mut polling = AlwaysPoll::default();

        f.agent.run_iteration(&mut state, &mut polling).await;
        assert!(state.tunnel_sync);

        f.plugin.set_fail_tunnel_sync(false);
        f.agent.run_iteration(&mut state, &mut polling).await;
        assert!(!state.tunnel_sync);

        f.agent.run_iteration(&mut state, &mut polling).await;
        assert_eq!(f.plugin.tunnel_sync_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_switch_error_forces_full_resync() {
        let mut f = fixture(Vec::new());
        // binding fails at the switch while clearing stale flows
        f.int_br.add_vif("tap1", "p1", 5);
        f.plugin.set_details(local_details("p1"));
        f.int_br.set_fail_flows(true);
        let mut state = LoopState {
            sync: false,
            tunnel_sync: false,
            ..Default::default()
        };
        let mut polling = AlwaysPoll::default();

        f.agent.run_iteration(&mut state, &mut polling).await;
        assert!(state.sync);
        assert!(state.tunnel_sync);
        assert!(state.ports.is_empty());
    }

    #[tokio::test]
    async fn test_quiet_polling_skips_scan_after_first_poll() {
        let mut f = fixture(Vec::new());
        let mut state = LoopState::default();
        let mut polling = Quiet::default();

        // sync forces the first poll
        f.agent.run_iteration(&mut state, &mut polling).await;
        f.int_br.add_vif("tap1", "p1", 5);
        f.plugin.set_details(local_details("p1"));

        let stats = f.agent.run_iteration(&mut state, &mut polling).await;
        assert_eq!(stats, PortStats::default());
        assert!(state.ports.is_empty());

        polling.force_polling();
        let stats = f.agent.run_iteration(&mut state, &mut polling).await;
        assert_eq!(stats.regular_added, 1);
    }

    #[tokio::test]
    async fn test_ancillary_ports_reported() {
        let f = fixture(Vec::new());
        let ex = SimBridge::shared("br-ex");
        ex.add_vif("qg-1", "router-gw", 3);
        let ex: Arc<dyn Bridge> = ex;
        let mut agent = f.agent.with_ancillary_bridges(vec![ex]);

        let mut state = LoopState::default();
        let mut polling = AlwaysPoll::default();
        let stats = agent.run_iteration(&mut state, &mut polling).await;
        assert_eq!(stats.ancillary_added, 1);
        assert_eq!(f.plugin.devices_up(), vec!["router-gw"]);
        assert_eq!(state.ancillary_ports.len(), 1);
    }
}
