//! Where desired state goes when an interface cannot run XDP.

use skansen_core::DesiredState;
use tracing::debug;

/// Receives the desired state of interfaces latched as unsupported, on every
/// cycle, so a slower enforcement path can take over.
pub trait FallbackHandler: Send + Sync {
    fn handle_unsupported(&self, interface: &str, desired: &DesiredState, reason: &str);
}

/// Records the hand-off and does nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingFallback;

impl FallbackHandler for LoggingFallback {
    fn handle_unsupported(&self, interface: &str, desired: &DesiredState, reason: &str) {
        debug!(
            interface,
            reason,
            entries = desired.len(),
            "Desired state handed to fallback"
        );
    }
}
