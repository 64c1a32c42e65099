//! ## skansen-prevention::failsafe
//! **Policy-independent allow-list consulted before any block table**
//!
//! Loaded once from configuration. Installed into the XDP program's failsafe
//! map at load time and evaluated in userspace by the in-memory kernel.

use std::collections::BTreeSet;

use skansen_common::{FailsafeKey, DIRECTION_INBOUND, DIRECTION_OUTBOUND};
use skansen_core::{Direction, FailsafeRule, PacketMeta, Protocol};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailsafeFilter {
    rules: BTreeSet<FailsafeRule>,
}

impl FailsafeFilter {
    pub fn new(rules: impl IntoIterator<Item = FailsafeRule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// True if `packet` matches a failsafe rule and must be accepted.
    ///
    /// Inbound rules look at the destination port, outbound rules at the
    /// source port. Only TCP and UDP ever match.
    pub fn permits(&self, packet: &PacketMeta) -> bool {
        let Some(protocol) = packet.transport.protocol() else {
            return false;
        };
        [Direction::Inbound, Direction::Outbound]
            .into_iter()
            .any(|direction| {
                packet
                    .transport
                    .port_for(direction)
                    .is_some_and(|port| {
                        self.rules
                            .contains(&FailsafeRule::new(protocol, port, direction))
                    })
            })
    }

    pub fn rules(&self) -> impl Iterator<Item = &FailsafeRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Keys for the kernel failsafe map.
    pub fn kernel_keys(&self) -> Vec<FailsafeKey> {
        self.rules.iter().map(kernel_key).collect()
    }
}

fn kernel_key(rule: &FailsafeRule) -> FailsafeKey {
    let direction = match rule.direction {
        Direction::Inbound => DIRECTION_INBOUND,
        Direction::Outbound => DIRECTION_OUTBOUND,
    };
    let protocol = match rule.protocol {
        Protocol::Tcp => skansen_common::PROTO_TCP,
        Protocol::Udp => skansen_common::PROTO_UDP,
    };
    FailsafeKey::new(protocol, rule.port, direction)
}
