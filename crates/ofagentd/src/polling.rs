//! Polling minimization.
//!
//! The reconciliation loop only rescans the switch when a [`PollingManager`]
//! says so. A forced poll always goes through, and once a poll was required
//! it stays required until the loop reports it completed.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ofagent_common::shell::as_root;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::build_ovsdb_monitor_cmd;

/// Force and completion bookkeeping shared by every manager.
#[derive(Debug, Clone, Copy)]
pub struct PollingState {
    force: bool,
    completed: bool,
}

impl Default for PollingState {
    fn default() -> Self {
        Self {
            force: false,
            completed: true,
        }
    }
}

pub trait PollingManager: Send {
    fn state(&mut self) -> &mut PollingState;

    /// Consumes the change signal of the underlying source.
    fn updates_pending(&mut self) -> bool;

    fn force_polling(&mut self) {
        self.state().force = true;
    }

    fn polling_completed(&mut self) {
        self.state().completed = true;
    }

    fn is_polling_required(&mut self) -> bool {
        // always consume pending updates
        let mut required = self.updates_pending();
        let state = self.state();
        if state.force {
            state.force = false;
            required = true;
        }
        if !state.completed {
            required = true;
        }
        if required {
            state.completed = false;
        }
        required
    }
}

/// Polls on every cycle.
#[derive(Debug, Default)]
pub struct AlwaysPoll {
    state: PollingState,
}

impl PollingManager for AlwaysPoll {
    fn state(&mut self) -> &mut PollingState {
        &mut self.state
    }

    fn updates_pending(&mut self) -> bool {
        true
    }
}

/// Polls only when the switch's Interface table changed, as reported by an
/// `ovsdb-client monitor` child process.
pub struct OvsdbMonitorPoller {
    state: PollingState,
    has_updates: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl OvsdbMonitorPoller {
    pub fn start(root_helper: &str, respawn_interval: Duration) -> Self {
        let has_updates = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicBool::new(false));
        let cmd = as_root(root_helper, &build_ovsdb_monitor_cmd());
        let task = tokio::spawn(run_monitor(
            cmd,
            respawn_interval,
            has_updates.clone(),
            active.clone(),
        ));
        Self {
            state: PollingState::default(),
            has_updates,
            active,
            task,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl PollingManager for OvsdbMonitorPoller {
    fn state(&mut self) -> &mut PollingState {
        &mut self.state
    }

    fn updates_pending(&mut self) -> bool {
        let updates = self.has_updates.swap(false, Ordering::SeqCst);
        !self.is_active() || updates
    }
}

impl Drop for OvsdbMonitorPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_monitor(
    cmd: String,
    respawn_interval: Duration,
    has_updates: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
) {
    loop {
        debug!(command = %cmd, "Starting interface monitor");
        let spawned = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                if let Some(stdout) = child.stdout.take() {
                    active.store(true, Ordering::SeqCst);
                    info!("Interface monitor running");
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if !line.trim().is_empty() {
                            has_updates.store(true, Ordering::SeqCst);
                        }
                    }
                }
                active.store(false, Ordering::SeqCst);
                let status = child.wait().await;
                warn!(
                    "Interface monitor exited ({:?}), respawning in {:?}",
                    status.ok(),
                    respawn_interval
                );
            }
            Err(e) => {
                active.store(false, Ordering::SeqCst);
                warn!("Unable to start interface monitor: {}", e);
            }
        }
        tokio::time::sleep(respawn_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scripted {
        state: PollingState,
        updates: bool,
    }

    impl PollingManager for Scripted {
        fn state(&mut self) -> &mut PollingState {
            &mut self.state
        }

        fn updates_pending(&mut self) -> bool {
            std::mem::take(&mut self.updates)
        }
    }

    #[test]
    fn test_always_poll() {
        let mut p = AlwaysPoll::default();
        assert!(p.is_polling_required());
        p.polling_completed();
        assert!(p.is_polling_required());
    }

    #[test]
    fn test_no_updates_no_poll() {
        let mut p = Scripted::default();
        assert!(!p.is_polling_required());
    }

    #[test]
    fn test_force_polling_is_one_shot() {
        let mut p = Scripted::default();
        p.force_polling();
        assert!(p.is_polling_required());
        p.polling_completed();
        assert!(!p.is_polling_required());
    }

    #[test]
    fn test_required_until_completed() {
        let mut p = Scripted {
            updates: true,
            ..Default::default()
        };
        assert!(p.is_polling_required());
        // the update was consumed but the poll never completed
        assert!(p.is_polling_required());
        p.polling_completed();
        assert!(!p.is_polling_required());
    }

    #[tokio::test]
    async fn test_inactive_monitor_requires_polling() {
        // the monitor task has not run yet on the current-thread runtime
        let mut p = OvsdbMonitorPoller::start("/nonexistent/helper", Duration::from_secs(3600));
        assert!(!p.is_active());
        assert!(p.is_polling_required());
        p.polling_completed();
        assert!(p.is_polling_required());
    }
}
