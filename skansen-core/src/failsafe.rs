//! Failsafe port rules: traffic that must never be dropped by a block table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Transport protocol a failsafe rule applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// IANA protocol number.
    pub const fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(CoreError::InvalidProtocol(other.to_string())),
        }
    }
}

/// Which side of the host the protected port lives on.
///
/// Inbound rules match the destination port of arriving packets, outbound
/// rules match the source port (replies to connections the host made).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FailsafeRule {
    pub protocol: Protocol,
    pub port: u16,
    pub direction: Direction,
}

impl FailsafeRule {
    pub const fn new(protocol: Protocol, port: u16, direction: Direction) -> Self {
        Self {
            protocol,
            port,
            direction,
        }
    }
}

impl fmt::Display for FailsafeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.direction, self.protocol, self.port)
    }
}

/// Protocol/port pair as written in configuration files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtoPort {
    pub protocol: Protocol,
    pub port: u16,
}

impl ProtoPort {
    pub const fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }

    pub const fn rule(self, direction: Direction) -> FailsafeRule {
        FailsafeRule::new(self.protocol, self.port, direction)
    }
}

/// Inbound ports kept reachable by default: ssh, dhcp client, bgp, etcd,
/// typha and kube-apiserver.
pub const DEFAULT_INBOUND: [ProtoPort; 9] = [
    ProtoPort::new(Protocol::Tcp, 22),
    ProtoPort::new(Protocol::Udp, 68),
    ProtoPort::new(Protocol::Tcp, 179),
    ProtoPort::new(Protocol::Tcp, 2379),
    ProtoPort::new(Protocol::Tcp, 2380),
    ProtoPort::new(Protocol::Tcp, 5473),
    ProtoPort::new(Protocol::Tcp, 6443),
    ProtoPort::new(Protocol::Tcp, 6666),
    ProtoPort::new(Protocol::Tcp, 6667),
];

/// Outbound ports kept reachable by default: dns, dhcp server, bgp, etcd,
/// typha and kube-apiserver.
pub const DEFAULT_OUTBOUND: [ProtoPort; 9] = [
    ProtoPort::new(Protocol::Udp, 53),
    ProtoPort::new(Protocol::Udp, 67),
    ProtoPort::new(Protocol::Tcp, 179),
    ProtoPort::new(Protocol::Tcp, 2379),
    ProtoPort::new(Protocol::Tcp, 2380),
    ProtoPort::new(Protocol::Tcp, 5473),
    ProtoPort::new(Protocol::Tcp, 6443),
    ProtoPort::new(Protocol::Tcp, 6666),
    ProtoPort::new(Protocol::Tcp, 6667),
];

/// The built-in failsafe set for both directions.
pub fn default_rules() -> Vec<FailsafeRule> {
    DEFAULT_INBOUND
        .iter()
        .map(|p| p.rule(Direction::Inbound))
        .chain(DEFAULT_OUTBOUND.iter().map(|p| p.rule(Direction::Outbound)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_ssh_and_dns_open() {
        let rules = default_rules();
        assert_eq!(rules.len(), 18);
        assert!(rules.contains(&FailsafeRule::new(Protocol::Tcp, 22, Direction::Inbound)));
        assert!(rules.contains(&FailsafeRule::new(Protocol::Udp, 53, Direction::Outbound)));
        assert!(!rules.contains(&FailsafeRule::new(Protocol::Tcp, 22, Direction::Outbound)));
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap().number(), 17);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn proto_port_deserializes_from_yaml() {
        let parsed: Vec<ProtoPort> =
            serde_yaml::from_str("- { protocol: tcp, port: 22 }\n- { protocol: udp, port: 68 }\n")
                .unwrap();
        assert_eq!(parsed, DEFAULT_INBOUND[..2].to_vec());
    }
}
