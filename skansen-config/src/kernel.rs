//! Kernel backend parameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelBackend {
    /// Native XDP via aya and rtnetlink.
    #[default]
    Aya,
    /// In-process model; no kernel is touched.
    Memory,
}

/// XDP attach mode. `Generic` runs in the networking stack and works on any
/// driver; `Driver` needs native driver support; `Offload` runs on the NIC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    #[default]
    Generic,
    Driver,
    Offload,
}

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct KernelConfig {
    #[serde(default)]
    pub backend: KernelBackend,

    /// Compiled XDP object. Falls back to `SKANSEN_BPF_OBJECT`, then to the
    /// build-time default.
    #[serde(default)]
    pub bpf_object: Option<PathBuf>,

    /// bpffs directory; per-interface maps live in `<pin_root>/<iface>/`.
    #[serde(default = "default_pin_root")]
    pub pin_root: PathBuf,

    #[serde(default)]
    pub xdp_mode: XdpMode,

    /// Block table capacity per interface and family.
    #[serde(default = "default_max_entries")]
    #[validate(range(min = 1, max = 1048576))]
    pub max_entries: u32,
}

pub const BPF_OBJECT_ENV: &str = "SKANSEN_BPF_OBJECT";
const DEFAULT_BPF_OBJECT: &str = "/usr/lib/skansen/skansen-ebpf";

fn default_pin_root() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/skansen/xdp")
}

fn default_max_entries() -> u32 {
    65536
}

impl KernelConfig {
    /// Location of the XDP object to load.
    pub fn resolve_bpf_object(&self) -> PathBuf {
        if let Some(path) = &self.bpf_object {
            return path.clone();
        }
        std::env::var_os(BPF_OBJECT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BPF_OBJECT))
    }

    pub fn pin_dir(&self, interface: &str) -> PathBuf {
        self.pin_root.join(interface)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            backend: KernelBackend::default(),
            bpf_object: None,
            pin_root: default_pin_root(),
            xdp_mode: XdpMode::default(),
            max_entries: default_max_entries(),
        }
    }
}
