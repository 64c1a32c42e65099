use std::time::Duration;

use skansen_config::ConfigError;
use skansen_policy::TranslateError;
use skansen_prevention::PreventionError;
use skansen_telemetry::TelemetryError;
use thiserror::Error;
use tokio::task::JoinError;

use crate::source::SourceError;

/// Why one sync cycle of one interface did not complete.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Prevention(#[from] PreventionError),

    #[error("Cycle on '{interface}' exceeded {after:?}")]
    Timeout { interface: String, after: Duration },

    #[error("Previous cycle on '{0}' still in flight")]
    Busy(String),

    #[error("Cycle task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Short label used for metrics and status.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Translate(TranslateError::InvalidSelector { .. }) => "invalid_selector",
            SyncError::Prevention(e) => e.kind(),
            SyncError::Timeout { .. } => "timeout",
            SyncError::Busy(_) => "busy",
            SyncError::Task(_) => "task_failed",
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            SyncError::Prevention(PreventionError::FeatureUnsupported { .. })
        )
    }
}

impl From<JoinError> for SyncError {
    fn from(err: JoinError) -> Self {
        SyncError::Task(err.to_string())
    }
}

/// Failures of the engine around the cycles: start-up and output files.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Policy source error: {0}")]
    Source(#[from] SourceError),

    #[error("Kernel backend unavailable: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Status encoding failed: {0}")]
    Encoding(#[from] serde_yaml::Error),

    #[error("Task failed: {0}")]
    Task(String),
}

impl From<JoinError> for EngineError {
    fn from(err: JoinError) -> Self {
        EngineError::Task(err.to_string())
    }
}
