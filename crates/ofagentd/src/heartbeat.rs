//! Periodic agent state reports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::plugin_rpc::{AgentStateReport, PluginApi};

/// Reports agent liveness independently of the reconciliation loop.
pub struct Heartbeat {
    plugin: Arc<dyn PluginApi>,
    template: AgentStateReport,
    interval: Duration,
    devices: watch::Receiver<usize>,
    start_flag: bool,
}

impl Heartbeat {
    pub fn new(
        plugin: Arc<dyn PluginApi>,
        template: AgentStateReport,
        interval: Duration,
        devices: watch::Receiver<usize>,
    ) -> Self {
        Self {
            plugin,
            template,
            interval,
            devices,
            start_flag: true,
        }
    }

    /// Assembles a fresh report from the template and the current device count.
    pub fn build_report(&self) -> AgentStateReport {
        let mut report = self.template.clone();
        report.configurations.devices = *self.devices.borrow();
        report.start_flag = self.start_flag.then_some(true);
        report
    }

    /// Sends one report; `start_flag` is dropped after the first success.
    pub async fn report_once(&mut self) {
        let report = self.build_report();
        match self.plugin.report_state(&report).await {
            Ok(()) => {
                if self.start_flag {
                    info!("Agent state reported");
                }
                self.start_flag = false;
            }
            Err(e) => warn!("Failed reporting state: {}", e),
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Heartbeat every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.report_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPluginClient;
    use pretty_assertions::assert_eq;

    fn template() -> AgentStateReport {
        AgentStateReport {
            binary: "ofagentd".to_string(),
            host: "compute-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_flag_cleared_after_success() {
        let plugin = SimPluginClient::shared();
        let (tx, rx) = watch::channel(0usize);
        let mut hb = Heartbeat::new(plugin.clone(), template(), Duration::from_secs(4), rx);

        plugin.set_fail_reports(true);
        hb.report_once().await;
        assert_eq!(hb.build_report().start_flag, Some(true));

        plugin.set_fail_reports(false);
        tx.send(3).unwrap();
        hb.report_once().await;
        hb.report_once().await;

        let reports = plugin.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].start_flag, Some(true));
        assert_eq!(reports[0].configurations.devices, 3);
        assert_eq!(reports[1].start_flag, None);
    }
}
