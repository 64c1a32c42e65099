//! Resync scheduler timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct ResyncConfig {
    /// Period of the unconditional reconciliation tick.
    #[serde(default = "default_period_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub period_secs: u64,

    /// Upper bound for one interface's sync cycle, kernel calls included.
    #[serde(default = "default_cycle_timeout_ms")]
    #[validate(range(min = 100, max = 60000))]
    pub cycle_timeout_ms: u64,

    /// How often queued policy events are drained between ticks.
    #[serde(default = "default_event_poll_ms")]
    #[validate(range(min = 1, max = 1000))]
    pub event_poll_ms: u64,

    /// Capacity of the policy event bus.
    #[serde(default = "default_event_capacity")]
    #[validate(range(min = 16, max = 1048576))]
    pub event_capacity: usize,
}

fn default_period_secs() -> u64 {
    10
}

fn default_cycle_timeout_ms() -> u64 {
    2000
}

fn default_event_poll_ms() -> u64 {
    50
}

fn default_event_capacity() -> usize {
    1024
}

impl ResyncConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            cycle_timeout_ms: default_cycle_timeout_ms(),
            event_poll_ms: default_event_poll_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}
