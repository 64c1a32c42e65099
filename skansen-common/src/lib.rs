//! # skansen-common
//!
//! Key and value layouts shared by the XDP program and the userspace control
//! plane. Everything here is `#[repr(C)]` and must stay byte-compatible with
//! the kernel side.
#![cfg_attr(not(test), no_std)]

/// Name of the XDP entry point. Also used to recognise our own program when
/// querying what is attached to an interface.
pub const PROGRAM_NAME: &str = "skansen_xdp";

/// IPv4 source block table (LPM trie keyed by `Key<[u8; 4]>`).
pub const BLOCK_MAP_V4: &str = "BLOCK_V4";
/// IPv6 source block table (LPM trie keyed by `Key<[u8; 16]>`).
pub const BLOCK_MAP_V6: &str = "BLOCK_V6";
/// Failsafe port allow-list (hash map keyed by [`FailsafeKey`]).
pub const FAILSAFE_MAP: &str = "FAILSAFE_PORTS";

/// Value stored for every block table entry.
pub const BLOCK_VALUE: u32 = 1;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Fragment offset bits of the IPv4 `frag_off` field.
pub const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

/// True for an IPv4 fragment other than the first. Such a fragment carries
/// no L4 header, so its payload must not be read as ports.
///
/// `frag_off` is in host byte order.
#[inline(always)]
pub const fn is_later_fragment(frag_off: u16) -> bool {
    frag_off & IPV4_FRAG_OFFSET_MASK != 0
}

/// Failsafe matched against the packet's destination port.
pub const DIRECTION_INBOUND: u8 = 0;
/// Failsafe matched against the packet's source port.
pub const DIRECTION_OUTBOUND: u8 = 1;

/// Key of the failsafe hash map.
///
/// `port` is in host byte order; the XDP program converts before lookup.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FailsafeKey {
    pub port: u16,
    pub protocol: u8,
    pub direction: u8,
}

impl FailsafeKey {
    pub const fn new(protocol: u8, port: u16, direction: u8) -> Self {
        Self {
            port,
            protocol,
            direction,
        }
    }
}

// SAFETY: #[repr(C)], Copy, no padding, primitive fields only.
#[cfg(feature = "user")]
unsafe impl aya::Pod for FailsafeKey {}
