//! Logging and status output.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct TelemetryConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    #[validate(custom(function = validation::validate_log_level))]
    pub log_level: String,

    #[serde(default)]
    pub json_logs: bool,

    /// Per-interface status, rewritten as YAML after every tick.
    #[serde(default)]
    pub status_path: Option<PathBuf>,

    /// Prometheus text exposition, rewritten after every tick.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            status_path: None,
            metrics_path: None,
        }
    }
}
