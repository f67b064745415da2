//! OpenFlow L2 agent.
//!
//! ofagentd runs on each hypervisor and keeps the local Open vSwitch flow
//! tables in line with the logical networks of the VMs it hosts:
//! - Local tag allocation per logical network
//! - Flow programming for vlan, flat, tunnel and local networks
//! - Port and tunnel reconciliation against the control plane
//! - Bridge bootstrap, heartbeat and inbound notifications

pub mod agent;
pub mod binding;
pub mod bridge;
pub mod bridge_setup;
pub mod commands;
pub mod config;
pub mod constants;
pub mod flow;
pub mod flow_programmer;
pub mod heartbeat;
pub mod notifications;
pub mod plugin_rpc;
pub mod polling;
pub mod port_reconciler;
pub mod security_group;
pub mod sim;
pub mod tag_allocator;
pub mod tunnel_reconciler;

pub use agent::{Agent, LoopState};
pub use binding::{NetworkBinding, PortBinding};
pub use bridge::{Bridge, OvsBridge};
pub use config::{AgentConfig, ValidatedConfig};
pub use flow::{FlowMatch, FlowMod};
pub use flow_programmer::{FlowProgrammer, PhysicalBridge};
pub use plugin_rpc::{HttpPluginClient, PluginApi};
pub use port_reconciler::{diff_ports, PortDelta, PortReconciler};
pub use tag_allocator::TagAllocator;
pub use tunnel_reconciler::TunnelReconciler;
