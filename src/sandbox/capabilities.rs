//! Capability set a compiled module is bound to

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// What a guest may reach over the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Outbound network access at all
    pub network_enabled: bool,
    /// Which remote addresses are reachable when the network is enabled
    pub allowed_addresses: AddressPolicy,
}

impl Capabilities {
    /// No network access
    pub fn isolated() -> Self {
        Self::default()
    }

    /// Whether the guest may connect to `addr`
    pub fn permits(&self, addr: &SocketAddr) -> bool {
        self.network_enabled && self.allowed_addresses.permits(addr)
    }
}

/// Address allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPolicy {
    /// Any address
    AllowAll,
    /// Only addresses matching one of the patterns
    Only(BTreeSet<AddressPattern>),
}

impl Default for AddressPolicy {
    fn default() -> Self {
        AddressPolicy::Only(BTreeSet::new())
    }
}

impl AddressPolicy {
    /// Build a policy from configured pattern strings; a lone `*` allows all
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.iter().any(|p| p.as_ref().trim() == "*") {
            return Ok(AddressPolicy::AllowAll);
        }
        let parsed = patterns
            .iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(AddressPolicy::Only(parsed))
    }

    pub fn permits(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressPolicy::AllowAll => true,
            AddressPolicy::Only(patterns) => patterns.iter().any(|p| p.matches(addr)),
        }
    }
}

/// One allow-list entry: `host[:port]` where host is an IP or `*`, port a number or `*`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressPattern {
    host: Option<IpAddr>,
    port: Option<u16>,
}

impl AddressPattern {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        self.host.map_or(true, |host| host == addr.ip())
            && self.port.map_or(true, |port| port == addr.port())
    }
}

impl std::str::FromStr for AddressPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::Config(format!("Invalid address pattern: {}", s));

        // Bracketed IPv6 with optional port, e.g. [::1]:8080
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let host: IpAddr = host.parse().map_err(|_| invalid())?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port).ok_or_else(invalid)?,
                None if tail.is_empty() => None,
                None => return Err(invalid()),
            };
            return Ok(AddressPattern {
                host: Some(host),
                port,
            });
        }

        // Bare IPv6 without port
        if s.matches(':').count() > 1 {
            let host: IpAddr = s.parse().map_err(|_| invalid())?;
            return Ok(AddressPattern {
                host: Some(host),
                port: None,
            });
        }

        let (host, port) = match s.split_once(':') {
            Some((host, port)) => (host, parse_port(port).ok_or_else(invalid)?),
            None => (s, None),
        };
        let host = match host {
            "*" => None,
            host => Some(host.parse().map_err(|_| invalid())?),
        };
        Ok(AddressPattern { host, port })
    }
}

/// `*` means any port; `None` signals a parse failure
fn parse_port(port: &str) -> Option<Option<u16>> {
    if port == "*" {
        Some(None)
    } else {
        port.parse().ok().map(Some)
    }
}

impl std::fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.host {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]", ip)?,
            Some(ip) => write!(f, "{}", ip)?,
            None => f.write_str("*")?,
        }
        match self.port {
            Some(port) => write!(f, ":{}", port),
            None => f.write_str(":*"),
        }
    }
}

impl TryFrom<String> for AddressPattern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AddressPattern> for String {
    fn from(pattern: AddressPattern) -> Self {
        pattern.to_string()
    }
}

/// Per-instance settings applied every time a compiled module is instantiated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceConfig {
    pub envs: BTreeMap<String, String>,
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_pattern_parsing() {
        let p: AddressPattern = "10.0.0.1:443".parse().unwrap();
        assert!(p.matches(&addr("10.0.0.1:443")));
        assert!(!p.matches(&addr("10.0.0.1:80")));
        assert!(!p.matches(&addr("10.0.0.2:443")));

        let any_port: AddressPattern = "10.0.0.1".parse().unwrap();
        assert!(any_port.matches(&addr("10.0.0.1:1234")));

        let any_host: AddressPattern = "*:443".parse().unwrap();
        assert!(any_host.matches(&addr("1.2.3.4:443")));
        assert!(!any_host.matches(&addr("1.2.3.4:80")));

        let v6: AddressPattern = "[::1]:8080".parse().unwrap();
        assert!(v6.matches(&addr("[::1]:8080")));
        let bare_v6: AddressPattern = "::1".parse().unwrap();
        assert!(bare_v6.matches(&addr("[::1]:9")));

        assert!("example.com:443".parse::<AddressPattern>().is_err());
        assert!("10.0.0.1:http".parse::<AddressPattern>().is_err());
        assert!("[::1".parse::<AddressPattern>().is_err());
    }

    #[test]
    fn test_pattern_display_round_trips() {
        for s in ["10.0.0.1:443", "*:443", "10.0.0.1:*", "[::1]:8080"] {
            let p: AddressPattern = s.parse().unwrap();
            assert_eq!(p.to_string().parse::<AddressPattern>().unwrap(), p);
        }
    }

    #[test]
    fn test_policy() {
        assert_eq!(
            AddressPolicy::from_patterns(&["10.0.0.1", "*"]).unwrap(),
            AddressPolicy::AllowAll
        );
        let policy = AddressPolicy::from_patterns(&["10.0.0.1:443"]).unwrap();
        assert!(policy.permits(&addr("10.0.0.1:443")));
        assert!(!policy.permits(&addr("10.0.0.9:443")));
        assert!(!AddressPolicy::default().permits(&addr("10.0.0.1:443")));
        assert!(AddressPolicy::from_patterns(&["nonsense"]).is_err());
    }

    #[test]
    fn test_capabilities_require_network_flag() {
        let caps = Capabilities {
            network_enabled: false,
            allowed_addresses: AddressPolicy::AllowAll,
        };
        assert!(!caps.permits(&addr("1.1.1.1:53")));

        let caps = Capabilities {
            network_enabled: true,
            ..caps
        };
        assert!(caps.permits(&addr("1.1.1.1:53")));
    }
}
