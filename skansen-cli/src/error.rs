use std::path::PathBuf;

use skansen_config::ConfigError;
use skansen_engine::{EngineError, SourceError};
use skansen_simulator::{ChaosConfigError, SimulationError};
use skansen_telemetry::TelemetryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Policy(#[from] SourceError),
    #[error(transparent)]
    Chaos(#[from] ChaosConfigError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("output encoding: {0}")]
    Encoding(#[from] serde_yaml::Error),
    #[error("state hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}
