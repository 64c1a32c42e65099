//! Failsafe ports: loaded once, never part of the resync protocol.

use serde::{Deserialize, Serialize};
use skansen_core::failsafe::{DEFAULT_INBOUND, DEFAULT_OUTBOUND};
use skansen_core::{Direction, FailsafeRule, ProtoPort};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct FailsafeConfig {
    /// Services on this host that must stay reachable (destination port).
    #[serde(default = "default_inbound")]
    #[validate(custom(function = validation::validate_ports))]
    pub inbound: Vec<ProtoPort>,

    /// Remote services this host must keep talking to (source port of replies).
    #[serde(default = "default_outbound")]
    #[validate(custom(function = validation::validate_ports))]
    pub outbound: Vec<ProtoPort>,
}

fn default_inbound() -> Vec<ProtoPort> {
    DEFAULT_INBOUND.to_vec()
}

fn default_outbound() -> Vec<ProtoPort> {
    DEFAULT_OUTBOUND.to_vec()
}

impl FailsafeConfig {
    pub fn rules(&self) -> Vec<FailsafeRule> {
        self.inbound
            .iter()
            .map(|p| p.rule(Direction::Inbound))
            .chain(self.outbound.iter().map(|p| p.rule(Direction::Outbound)))
            .collect()
    }
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            inbound: default_inbound(),
            outbound: default_outbound(),
        }
    }
}
