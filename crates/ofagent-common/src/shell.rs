//! Shell command execution for switch programming.
//!
//! Commands run through `/bin/sh -c`; every user-supplied argument must be
//! passed through [`shellquote`]. Privileged commands are prefixed with the
//! configured root helper via [`as_root`].
//!
//! # Example
//!
//! ```ignore
//! use ofagent_common::shell::{self, as_root, shellquote, OVS_VSCTL_CMD};
//!
//! let cmd = format!("{} --timeout=10 br-exists {}", OVS_VSCTL_CMD, shellquote("br-int"));
//! let result = shell::exec(&as_root("sudo", &cmd)).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{AgentError, AgentResult};

/// Path to `ovs-vsctl` for switch database changes.
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to `ovs-ofctl` for flow table changes.
pub const OVS_OFCTL_CMD: &str = "/usr/bin/ovs-ofctl";

/// Path to `ovsdb-client` for the interface monitor.
pub const OVSDB_CLIENT_CMD: &str = "/usr/bin/ovsdb-client";

/// Path to the `ip` command for veth plumbing.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to `udevadm`, used to settle device events after link removal.
pub const UDEVADM_CMD: &str = "/sbin/udevadm";

/// Path to `modinfo`, used to read the kernel datapath version.
pub const MODINFO_CMD: &str = "/sbin/modinfo";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// ```
/// use ofagent_common::shell::shellquote;
///
/// assert_eq!(shellquote("br-int"), "\"br-int\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Prefixes `cmd` with the root helper. An empty helper runs the command as is.
///
/// ```
/// use ofagent_common::shell::as_root;
///
/// assert_eq!(as_root("sudo", "/sbin/ip link"), "sudo /sbin/ip link");
/// assert_eq!(as_root("", "/sbin/ip link"), "/sbin/ip link");
/// ```
pub fn as_root(root_helper: &str, cmd: &str) -> String {
    let helper = root_helper.trim();
    if helper.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", helper, cmd)
    }
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously.
///
/// Returns `Err` only when the command could not be spawned; a non-zero
/// exit is reported through [`ExecResult::exit_code`].
pub async fn exec(cmd: &str) -> AgentResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AgentError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns its stdout, failing on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> AgentResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(AgentError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
