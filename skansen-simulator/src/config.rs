use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Knobs of a chaos run. Probabilities are per resync tick.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChaosConfig {
    /// Number of simulated interfaces, named `eth0`, `eth1`, ...
    pub interfaces: usize,
    /// Chance that one external fault is injected before a tick.
    pub fault_probability: f64,
    /// Chance that the policy changes before a tick.
    pub policy_churn_probability: f64,
    /// Simulated resync period.
    pub period_secs: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            interfaces: 3,
            fault_probability: 0.3,
            policy_churn_probability: 0.2,
            period_secs: 10,
        }
    }
}

impl ChaosConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Same run without any injected faults.
    pub fn calm(&self) -> Self {
        Self {
            fault_probability: 0.0,
            ..self.clone()
        }
    }
}

#[derive(Error, Debug)]
pub enum ChaosConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    Serde(#[from] serde_yaml::Error),
    #[error("Probability {0} is outside 0..=1")]
    Probability(f64),
}

/// Loads a chaos configuration from a YAML file.
pub fn load_chaos_config<P: AsRef<Path>>(path: P) -> Result<ChaosConfig, ChaosConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ChaosConfigError::FileNotFound(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let config: ChaosConfig = serde_yaml::from_str(&content)?;
    for p in [config.fault_probability, config.policy_churn_probability] {
        if !(0.0..=1.0).contains(&p) {
            return Err(ChaosConfigError::Probability(p));
        }
    }
    Ok(config)
}
