//! Common value types for the OpenFlow L2 agent.
//!
//! This crate provides type-safe representations of the primitives that
//! flow between the control plane and the switch:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers and the local tag space
//! - [`NetworkType`] / [`TunnelType`]: logical network encapsulations
//! - [`OfPort`] / [`VifPort`]: switch port numbers and VM interfaces

mod mac;
mod network;
mod port;
mod vlan;

pub use mac::MacAddress;
pub use network::{NetworkType, TunnelType};
pub use port::{OfPort, VifPort};
pub use vlan::{VlanId, DEAD_VLAN_TAG, MAX_VLAN_TAG, MIN_VLAN_TAG};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid tunnel type: {0}")]
    InvalidTunnelType(String),

    #[error("invalid switch port number: {0}")]
    InvalidOfPort(String),
}
