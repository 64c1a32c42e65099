//! # Skansen Configuration System
//!
//! Layered configuration for the XDP deny-list enforcer. Loaded once at
//! process start and immutable afterwards; the engine shares it behind an
//! `Arc`.
//!
//! Sections:
//! - `resync`: reconciliation period, cycle timeout, event draining
//! - `failsafe`: ports that stay reachable whatever the policy says
//! - `kernel`: backend selection, XDP object, pin root, attach mode
//! - `policy`: location of the policy document
//! - `telemetry`: log level and status/metrics files

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod error;
mod failsafe;
mod kernel;
mod policy;
mod resync;
mod telemetry;
pub mod validation;

pub use error::ConfigError;
pub use failsafe::FailsafeConfig;
pub use kernel::{KernelBackend, KernelConfig, XdpMode, BPF_OBJECT_ENV};
pub use policy::PolicyConfig;
pub use resync::ResyncConfig;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/skansen.yaml";
const ENV_PREFIX: &str = "SKANSEN_";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct SkansenConfig {
    #[validate(nested)]
    #[serde(default)]
    pub resync: ResyncConfig,

    #[validate(nested)]
    #[serde(default)]
    pub failsafe: FailsafeConfig,

    #[validate(nested)]
    #[serde(default)]
    pub kernel: KernelConfig,

    #[validate(nested)]
    #[serde(default)]
    pub policy: PolicyConfig,

    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl SkansenConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/skansen.yaml`, if present
    /// 3. `config/<SKANSEN_ENV>.yaml`, if present (env defaults to `production`)
    /// 4. `SKANSEN_*` environment variables, `__` separating nested keys
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(SkansenConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        }

        let env = std::env::var("SKANSEN_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::finish(figment)
    }

    /// Load configuration from a specific file (plus environment overrides).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        let figment =
            Figment::from(Serialized::defaults(SkansenConfig::default())).merge(Yaml::file(path));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn default_config_validates() {
        let config = SkansenConfig::default();
        config.validate().expect("Default config should validate");
        assert_eq!(config.resync.period_secs, 10);
        assert_eq!(config.failsafe.rules().len(), 18);
        assert_eq!(config.kernel.xdp_mode, XdpMode::Generic);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = write_yaml(
            "resync:\n  period_secs: 3\nkernel:\n  backend: memory\nfailsafe:\n  inbound:\n    - { protocol: tcp, port: 2222 }\n",
        );
        let config = SkansenConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.resync.period_secs, 3);
        assert_eq!(config.resync.cycle_timeout_ms, 2000);
        assert_eq!(config.kernel.backend, KernelBackend::Memory);
        assert_eq!(config.failsafe.inbound.len(), 1);
        assert_eq!(config.failsafe.outbound.len(), 9);
    }

    #[test]
    fn out_of_range_period_is_rejected() {
        let file = write_yaml("resync:\n  period_secs: 0\n");
        let err = SkansenConfig::load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("resync.period_secs"));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = SkansenConfig::load_from_path("/nonexistent/skansen.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn environment_override() {
        std::env::set_var("SKANSEN_KERNEL__MAX_ENTRIES", "4096");
        let config = SkansenConfig::load().unwrap();
        std::env::remove_var("SKANSEN_KERNEL__MAX_ENTRIES");
        assert_eq!(config.kernel.max_entries, 4096);
    }

    #[test]
    fn pin_dir_is_per_interface() {
        let kernel = KernelConfig::default();
        assert_eq!(
            kernel.pin_dir("eth0"),
            PathBuf::from("/sys/fs/bpf/skansen/xdp/eth0")
        );
    }
}
