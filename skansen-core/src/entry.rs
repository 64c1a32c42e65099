//! ## skansen-core::entry
//! **Normalized block prefixes and their LPM trie key encoding**
//!
//! A `BlockEntry` is an address prefix with every bit beyond the mask cleared,
//! so two spellings of the same network compare equal and diff cleanly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::family::IpFamily;

/// One deny entry of a per-interface block table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockEntry {
    addr: IpAddr,
    prefix_len: u8,
}

impl BlockEntry {
    /// Builds a normalized entry, clearing host bits beyond `prefix_len`.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, CoreError> {
        let width = IpFamily::of(&addr).width();
        if prefix_len > width {
            return Err(CoreError::PrefixTooLong { prefix_len, width });
        }
        Ok(Self {
            addr: mask_addr(addr, prefix_len),
            prefix_len,
        })
    }

    /// Host route covering exactly `addr`.
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = IpFamily::of(&addr).width();
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.addr)
    }

    /// Address bytes in network byte order.
    pub fn octets(&self) -> Vec<u8> {
        match self.addr {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        }
    }

    /// True when `addr` falls inside this prefix.
    pub fn contains(&self, addr: IpAddr) -> bool {
        IpFamily::of(&addr) == self.family() && mask_addr(addr, self.prefix_len) == self.addr
    }

    /// Kernel `bpf_lpm_trie_key` bytes: prefix length (host byte order)
    /// followed by the address in network byte order.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut key = u32::from(self.prefix_len).to_ne_bytes().to_vec();
        key.extend(self.octets());
        key
    }

    /// Space separated hex rendering of [`Self::key_bytes`], the form
    /// `bpftool map lookup ... key hex` accepts.
    pub fn key_hex(&self) -> String {
        self.key_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<IpNetwork> for BlockEntry {
    fn from(net: IpNetwork) -> Self {
        Self {
            addr: mask_addr(net.ip(), net.prefix()),
            prefix_len: net.prefix(),
        }
    }
}

impl FromStr for BlockEntry {
    type Err = CoreError;

    /// Accepts `addr` (host route) or `addr/len`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidPrefix(s.to_string()));
        }
        let net: IpNetwork = s
            .parse()
            .map_err(|_| CoreError::InvalidPrefix(s.to_string()))?;
        Ok(Self::from(net))
    }
}

impl fmt::Display for BlockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Serialize for BlockEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn mask_addr(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(a) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len.min(32)))
            };
            IpAddr::V4(Ipv4Addr::from(u32::from(a) & mask))
        }
        IpAddr::V6(a) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len.min(128)))
            };
            IpAddr::V6(Ipv6Addr::from(u128::from(a) & mask))
        }
    }
}
