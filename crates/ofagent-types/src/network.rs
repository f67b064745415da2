//! Logical network encapsulation kinds.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tunnel encapsulation supported on the tunnel bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Gre,
    Vxlan,
}

impl TunnelType {
    pub const ALL: [TunnelType; 2] = [TunnelType::Gre, TunnelType::Vxlan];

    pub const fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Gre => "gre",
            TunnelType::Vxlan => "vxlan",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gre" => Ok(TunnelType::Gre),
            "vxlan" => Ok(TunnelType::Vxlan),
            _ => Err(ParseError::InvalidTunnelType(s.to_string())),
        }
    }
}

/// Encapsulation of a logical network as reported by the plugin.
///
/// Unknown kinds are kept verbatim so that they can be reported instead of
/// failing deserialization of the whole device record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NetworkType {
    Flat,
    Vlan,
    Local,
    Tunnel(TunnelType),
    Other(String),
}

impl NetworkType {
    /// Returns the tunnel encapsulation for `gre`/`vxlan` networks.
    pub fn tunnel_type(&self) -> Option<TunnelType> {
        match self {
            NetworkType::Tunnel(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_tunnel(&self) -> bool {
        self.tunnel_type().is_some()
    }

    pub fn as_str(&self) -> &str {
        match self {
            NetworkType::Flat => "flat",
            NetworkType::Vlan => "vlan",
            NetworkType::Local => "local",
            NetworkType::Tunnel(t) => t.as_str(),
            NetworkType::Other(s) => s,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for NetworkType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "flat" => NetworkType::Flat,
            "vlan" => NetworkType::Vlan,
            "local" => NetworkType::Local,
            other => match other.parse::<TunnelType>() {
                Ok(t) => NetworkType::Tunnel(t),
                Err(_) => NetworkType::Other(s.to_string()),
            },
        }
    }
}

impl From<String> for NetworkType {
    fn from(s: String) -> Self {
        NetworkType::from(s.as_str())
    }
}

impl From<NetworkType> for String {
    fn from(t: NetworkType) -> String {
        t.as_str().to_string()
    }
}

impl From<TunnelType> for NetworkType {
    fn from(t: TunnelType) -> Self {
        NetworkType::Tunnel(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_str() {
        assert_eq!(NetworkType::from("vlan"), NetworkType::Vlan);
        assert_eq!(NetworkType::from("FLAT"), NetworkType::Flat);
        assert_eq!(NetworkType::from("gre"), NetworkType::Tunnel(TunnelType::Gre));
        assert_eq!(
            NetworkType::from("vxlan").tunnel_type(),
            Some(TunnelType::Vxlan)
        );
        assert_eq!(
            NetworkType::from("geneve"),
            NetworkType::Other("geneve".to_string())
        );
    }

    #[test]
    fn test_serde_keeps_unknown_kinds() {
        let t: NetworkType = serde_json::from_str("\"stt\"").unwrap();
        assert_eq!(t.as_str(), "stt");
        assert!(!t.is_tunnel());
        assert_eq!(serde_json::to_string(&NetworkType::Local).unwrap(), "\"local\"");
    }

    #[test]
    fn test_invalid_tunnel_type() {
        assert!("ipip".parse::<TunnelType>().is_err());
        assert_eq!("GRE".parse::<TunnelType>().unwrap(), TunnelType::Gre);
    }
}
