//! Switch port numbers and VM interface ports.

use crate::{MacAddress, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OpenFlow port number assigned by the switch.
///
/// The switch reports `-1` (or nothing) while a port is not attached to the
/// datapath, so the value is kept signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OfPort(i32);

impl OfPort {
    pub const INVALID: OfPort = OfPort(-1);

    pub const fn new(n: i32) -> Self {
        OfPort(n)
    }

    pub const fn as_i32(&self) -> i32 {
        self.0
    }

    /// A port number usable in matches and outputs.
    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Port number for OpenFlow encoding, `None` when invalid.
    pub fn number(&self) -> Option<u32> {
        if self.is_valid() {
            Some(self.0 as u32)
        } else {
            None
        }
    }
}

impl fmt::Display for OfPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OfPort {
    type Err = ParseError;

    /// Parses `ovs-vsctl get Interface <name> ofport` output. An unset
    /// column (`[]`) maps to [`OfPort::INVALID`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "[]" || s.is_empty() {
            return Ok(OfPort::INVALID);
        }
        s.parse::<i32>()
            .map(OfPort)
            .map_err(|_| ParseError::InvalidOfPort(s.to_string()))
    }
}

/// A VM interface on the integration bridge: a port that carries the
/// `iface-id` and `attached-mac` external ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VifPort {
    pub port_name: String,
    pub ofport: OfPort,
    pub vif_id: String,
    pub vif_mac: Option<MacAddress>,
    pub bridge: String,
}

impl VifPort {
    pub fn new(
        port_name: impl Into<String>,
        ofport: OfPort,
        vif_id: impl Into<String>,
        bridge: impl Into<String>,
    ) -> Self {
        Self {
            port_name: port_name.into(),
            ofport,
            vif_id: vif_id.into(),
            vif_mac: None,
            bridge: bridge.into(),
        }
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.vif_mac = Some(mac);
        self
    }
}
