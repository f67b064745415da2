//! Shared infrastructure for the OpenFlow L2 agent.
//!
//! - [`shell`]: quoted shell command execution, optionally through a root helper
//! - [`error`]: the agent error taxonomy
//!
//! # Example
//!
//! ```ignore
//! use ofagent_common::{
//!     shell::{self, OVS_VSCTL_CMD, shellquote},
//!     AgentResult,
//! };
//!
//! async fn set_tag(port: &str, tag: u16) -> AgentResult<()> {
//!     let cmd = format!("{} set Port {} tag={}", OVS_VSCTL_CMD, shellquote(port), tag);
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{AgentError, AgentResult};
