//! Per-interface state. One `InterfaceContext` per interface, each behind
//! its own lock; nothing is shared between interfaces.

use chrono::{DateTime, Utc};
use skansen_prevention::{BindingState, BlockTableManager, HookAttacher};

use crate::status::InterfaceStatus;

/// Bookkeeping of sync attempts on one interface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResyncState {
    /// Number of fully successful cycles.
    pub generation: u64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct InterfaceContext {
    interface: String,
    pub(crate) tables: BlockTableManager,
    pub(crate) hook: HookAttacher,
    pub(crate) resync: ResyncState,
    /// False until the first cycle has run, which is always a kernel resync.
    pub(crate) reconciled: bool,
}

impl InterfaceContext {
    pub fn new(interface: impl Into<String>) -> Self {
        let interface = interface.into();
        Self {
            tables: BlockTableManager::new(interface.clone()),
            hook: HookAttacher::new(interface.clone()),
            resync: ResyncState::default(),
            reconciled: false,
            interface,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn generation(&self) -> u64 {
        self.resync.generation
    }

    pub fn resync_state(&self) -> &ResyncState {
        &self.resync
    }

    pub fn tables(&self) -> &BlockTableManager {
        &self.tables
    }

    pub fn hook(&self) -> &HookAttacher {
        &self.hook
    }

    /// True while the interface still needs attention on every resync even
    /// without rules naming it.
    pub fn has_interest(&self) -> bool {
        self.tables.has_entries()
            || self.hook.program().is_some()
            || !matches!(
                self.hook.state(),
                BindingState::NoProgram | BindingState::Unsupported
            )
    }

    pub fn status(&self) -> InterfaceStatus {
        let program = self.hook.program();
        InterfaceStatus {
            interface: self.interface.clone(),
            attached: program.is_some(),
            program_id: program.map(|p| p.id),
            program_name: program.map(|p| p.name.clone()),
            generation: self.resync.generation,
            binding_state: self.hook.state(),
            entries: self.tables.entry_counts(),
            unsupported: self.hook.is_unsupported(),
            last_attempt: self.resync.last_attempt,
            last_success: self.resync.last_success,
            last_error: self.resync.last_error.clone(),
            busy: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_has_no_interest() {
        let ctx = InterfaceContext::new("eth0");
        assert!(!ctx.has_interest());
        assert_eq!(ctx.generation(), 0);

        let status = ctx.status();
        assert_eq!(status.interface, "eth0");
        assert!(!status.attached);
        assert_eq!(status.binding_state, BindingState::NoProgram);
        assert!(status.entries.is_empty());
    }
}
