//! Where the policy snapshot comes from.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct PolicyConfig {
    /// YAML policy document (address sets and block rules).
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// How often the watcher re-reads the document and emits change events.
    #[serde(default = "default_watch_interval_ms")]
    #[validate(range(min = 10, max = 600000))]
    pub watch_interval_ms: u64,
}

fn default_path() -> PathBuf {
    PathBuf::from("config/policy.yaml")
}

fn default_watch_interval_ms() -> u64 {
    1000
}

impl PolicyConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}
