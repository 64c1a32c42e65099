//! ## skansen-prevention::hook
//! **Hook Attacher: the XDP program lifecycle on one interface**
//!
//! State machine:
//!
//! ```text
//! NoProgram -> Attaching -> Attached
//! Attached  -> Reattaching -> Attached      (program vanished: drift)
//! Attached  -> Detaching -> NoProgram       (desired state became empty)
//! any       -> Unsupported                  (probe failed, terminal)
//! ```
//!
//! Every transition starts from a fresh query of the kernel, so the recorded
//! state is only ever a hint about what happened last time.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{KernelError, PreventionError};
use crate::kernel::{ProbeOutcome, ProgramInfo, XdpKernel};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    #[default]
    NoProgram,
    Attaching,
    Attached,
    Reattaching,
    Detaching,
    Unsupported,
}

/// Things worth telling an operator about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Attached(ProgramInfo),
    /// Our program was found already attached (e.g. by a previous process).
    Adopted(ProgramInfo),
    /// Our program disappeared and was attached again.
    Reattached {
        previous: Option<ProgramInfo>,
        current: ProgramInfo,
    },
    /// Someone else's program was detached to make room for ours.
    ForeignReplaced {
        foreign: ProgramInfo,
        current: ProgramInfo,
    },
    Detached(ProgramInfo),
    Unsupported(String),
}

impl HookEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HookEvent::Attached(_) => "attached",
            HookEvent::Adopted(_) => "adopted",
            HookEvent::Reattached { .. } => "program_missing",
            HookEvent::ForeignReplaced { .. } => "foreign_program",
            HookEvent::Detached(_) => "detached",
            HookEvent::Unsupported(_) => "feature_unsupported",
        }
    }

    /// True for events that repair external interference.
    pub fn is_drift(&self) -> bool {
        matches!(
            self,
            HookEvent::Reattached { .. } | HookEvent::ForeignReplaced { .. }
        )
    }
}

#[derive(Debug)]
pub struct HookAttacher {
    interface: String,
    state: BindingState,
    program: Option<ProgramInfo>,
    probed: bool,
    unsupported_reason: Option<String>,
}

impl HookAttacher {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            state: BindingState::NoProgram,
            program: None,
            probed: false,
            unsupported_reason: None,
        }
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    /// Program this attacher last saw attached.
    pub fn program(&self) -> Option<&ProgramInfo> {
        self.program.as_ref()
    }

    pub fn is_unsupported(&self) -> bool {
        self.state == BindingState::Unsupported
    }

    fn unsupported(&self) -> PreventionError {
        PreventionError::FeatureUnsupported {
            interface: self.interface.clone(),
            reason: self
                .unsupported_reason
                .clone()
                .unwrap_or_else(|| "probe failed".into()),
        }
    }

    fn attach_failed(&self, source: KernelError) -> PreventionError {
        PreventionError::AttachFailed {
            interface: self.interface.clone(),
            source,
        }
    }

    fn detach_failed(&self, source: KernelError) -> PreventionError {
        PreventionError::DetachFailed {
            interface: self.interface.clone(),
            source,
        }
    }

    /// Runs the capability probe once. An unsupported answer latches for the
    /// lifetime of this attacher and is reported on every later call without
    /// touching the kernel.
    pub fn ensure_supported(
        &mut self,
        kernel: &dyn XdpKernel,
        events: &mut Vec<HookEvent>,
    ) -> Result<(), PreventionError> {
        if self.is_unsupported() {
            return Err(self.unsupported());
        }
        if self.probed {
            return Ok(());
        }
        match kernel
            .probe(&self.interface)
            .map_err(|e| self.attach_failed(e))?
        {
            ProbeOutcome::Supported => {
                self.probed = true;
                Ok(())
            }
            ProbeOutcome::Unsupported(reason) => {
                warn!(interface = %self.interface, %reason, "XDP unsupported, disabling interface");
                self.state = BindingState::Unsupported;
                self.program = None;
                self.unsupported_reason = Some(reason.clone());
                events.push(HookEvent::Unsupported(reason));
                Err(self.unsupported())
            }
        }
    }

    /// Current program identity as reported by the kernel.
    pub fn query_identity(&self, kernel: &dyn XdpKernel) -> Result<Option<ProgramInfo>, KernelError> {
        kernel.query_program(&self.interface)
    }

    /// Makes sure our program is attached. Idempotent.
    pub fn ensure_attached(
        &mut self,
        kernel: &dyn XdpKernel,
    ) -> Result<Vec<HookEvent>, PreventionError> {
        let mut events = Vec::new();
        self.ensure_supported(kernel, &mut events)?;

        let current = self
            .query_identity(kernel)
            .map_err(|e| self.attach_failed(e))?;

        let foreign = match current {
            Some(program) if program.is_ours() => {
                if self.program.is_none() {
                    info!(interface = %self.interface, id = program.id, "Adopting attached program");
                    events.push(HookEvent::Adopted(program.clone()));
                } else if self.program.as_ref() != Some(&program) {
                    debug!(interface = %self.interface, id = program.id, "Program identity changed");
                }
                self.program = Some(program);
                self.state = BindingState::Attached;
                return Ok(events);
            }
            Some(foreign) => {
                warn!(
                    interface = %self.interface,
                    id = foreign.id,
                    name = %foreign.name,
                    "Foreign XDP program attached, replacing"
                );
                kernel
                    .detach(&self.interface, &foreign)
                    .map_err(|e| self.attach_failed(e))?;
                Some(foreign)
            }
            None => None,
        };

        let previous = self.program.take();
        let drifted = foreign.is_none()
            && matches!(
                self.state,
                BindingState::Attached | BindingState::Reattaching
            );
        self.state = if drifted || foreign.is_some() {
            if drifted {
                warn!(interface = %self.interface, "Program missing, reattaching");
            }
            BindingState::Reattaching
        } else {
            BindingState::Attaching
        };

        let attached = kernel
            .attach(&self.interface)
            .map_err(|e| self.attach_failed(e))?;
        info!(interface = %self.interface, id = attached.id, "Program attached");

        events.push(match (foreign, drifted) {
            (Some(foreign), _) => HookEvent::ForeignReplaced {
                foreign,
                current: attached.clone(),
            },
            (None, true) => HookEvent::Reattached {
                previous,
                current: attached.clone(),
            },
            (None, false) => HookEvent::Attached(attached.clone()),
        });
        self.program = Some(attached);
        self.state = BindingState::Attached;
        Ok(events)
    }

    /// Makes sure our program is not attached. Absence is not an error and
    /// foreign programs are left alone.
    pub fn ensure_detached(
        &mut self,
        kernel: &dyn XdpKernel,
    ) -> Result<Vec<HookEvent>, PreventionError> {
        if self.is_unsupported() {
            return Ok(Vec::new());
        }
        let current = self
            .query_identity(kernel)
            .map_err(|e| self.detach_failed(e))?;

        let mut events = Vec::new();
        match current {
            Some(program) if program.is_ours() => {
                self.state = BindingState::Detaching;
                kernel
                    .detach(&self.interface, &program)
                    .map_err(|e| self.detach_failed(e))?;
                info!(interface = %self.interface, id = program.id, "Program detached");
                events.push(HookEvent::Detached(program));
            }
            Some(foreign) => {
                debug!(interface = %self.interface, id = foreign.id, "Leaving foreign program alone");
            }
            None => {}
        }
        self.program = None;
        self.state = BindingState::NoProgram;
        Ok(events)
    }
}
