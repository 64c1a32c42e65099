use std::fmt;

use skansen_core::{BlockEntry, IpFamily};
use thiserror::Error;

/// Failure of a single kernel call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("Interface '{0}' does not exist")]
    NoSuchInterface(String),

    #[error("Table write failed: {0}")]
    Write(String),

    #[error("Table read failed: {0}")]
    Read(String),

    #[error("Program operation failed: {0}")]
    Program(String),

    #[error("Netlink request failed: {0}")]
    Netlink(String),
}

/// Which step of a table apply failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStage {
    Read,
    Insert(BlockEntry),
    Remove(BlockEntry),
    Destroy,
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStage::Read => f.write_str("read"),
            ApplyStage::Insert(e) => write!(f, "insert {e}"),
            ApplyStage::Remove(e) => write!(f, "remove {e}"),
            ApplyStage::Destroy => f.write_str("destroy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreventionError {
    #[error("XDP is not supported on '{interface}': {reason}")]
    FeatureUnsupported { interface: String, reason: String },

    #[error("Applying the {family} table on '{interface}' failed at {stage}: {source}")]
    ApplyFailed {
        interface: String,
        family: IpFamily,
        stage: ApplyStage,
        #[source]
        source: KernelError,
    },

    #[error("Attaching to '{interface}' failed: {source}")]
    AttachFailed {
        interface: String,
        #[source]
        source: KernelError,
    },

    #[error("Detaching from '{interface}' failed: {source}")]
    DetachFailed {
        interface: String,
        #[source]
        source: KernelError,
    },
}

impl PreventionError {
    /// Short label used for metrics and status.
    pub fn kind(&self) -> &'static str {
        match self {
            PreventionError::FeatureUnsupported { .. } => "feature_unsupported",
            PreventionError::ApplyFailed { .. } => "apply_failed",
            PreventionError::AttachFailed { .. } => "attach_failed",
            PreventionError::DetachFailed { .. } => "detach_failed",
        }
    }
}
