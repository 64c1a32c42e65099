//! ## skansen-engine::sync
//! **One sync cycle: desired state → tables → hook, for one interface**
//!
//! Ordering matters for safety:
//! - non-empty desired state: probe, write tables, then attach. The program
//!   never runs against a table that is still being filled for the first time.
//! - empty desired state: detach first, then destroy the tables. Nothing
//!   is filtered by a half-torn-down table.
//!
//! The generation only advances when every step succeeded.

use chrono::Utc;
use serde::Serialize;
use skansen_core::DesiredState;
use skansen_prevention::{
    ApplyReport, Baseline, HookEvent, PreventionError, XdpKernel,
};
use tracing::{debug, instrument};

use crate::context::InterfaceContext;
use crate::error::SyncError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Triggered by a policy change; diffs against what was last applied.
    Event,
    /// Periodic; diffs against what the kernel holds.
    Resync,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Event => "event",
            SyncMode::Resync => "resync",
        }
    }

    fn baseline(self) -> Baseline {
        match self {
            SyncMode::Event => Baseline::LastApplied,
            SyncMode::Resync => Baseline::Kernel,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncReport {
    pub interface: String,
    /// Mode actually used; the first cycle is promoted to `Resync`.
    pub mode: SyncMode,
    pub generation: u64,
    pub apply: ApplyReport,
    pub hook_events: Vec<HookEvent>,
    pub desired_entries: usize,
}

/// Runs one cycle. Blocking; call from the blocking pool.
#[instrument(skip_all, fields(interface = %ctx.interface(), mode = mode.as_str()))]
pub fn run_cycle(
    ctx: &mut InterfaceContext,
    kernel: &dyn XdpKernel,
    desired: &DesiredState,
    mode: SyncMode,
) -> Result<SyncReport, SyncError> {
    let mode = if ctx.reconciled { mode } else { SyncMode::Resync };
    ctx.resync.last_attempt = Some(Utc::now());

    match apply_and_bind(ctx, kernel, desired, mode) {
        Ok((apply, hook_events)) => {
            ctx.reconciled = true;
            ctx.resync.generation += 1;
            ctx.resync.last_success = ctx.resync.last_attempt;
            ctx.resync.last_error = None;
            debug!(
                generation = ctx.resync.generation,
                entries = desired.len(),
                "Cycle complete"
            );
            Ok(SyncReport {
                interface: ctx.interface().to_string(),
                mode,
                generation: ctx.resync.generation,
                apply,
                hook_events,
                desired_entries: desired.len(),
            })
        }
        Err(err) => {
            ctx.resync.last_error = Some(err.to_string());
            Err(err.into())
        }
    }
}

fn apply_and_bind(
    ctx: &mut InterfaceContext,
    kernel: &dyn XdpKernel,
    desired: &DesiredState,
    mode: SyncMode,
) -> Result<(ApplyReport, Vec<HookEvent>), PreventionError> {
    let mut hook_events = Vec::new();
    if ctx.hook.is_unsupported() {
        // Latched: report again without touching the kernel.
        ctx.hook.ensure_supported(kernel, &mut hook_events)?;
    }

    if desired.is_empty() {
        hook_events.extend(ctx.hook.ensure_detached(kernel)?);
        let apply = ctx.tables.apply(kernel, desired, mode.baseline())?;
        Ok((apply, hook_events))
    } else {
        ctx.hook.ensure_supported(kernel, &mut hook_events)?;
        let apply = ctx.tables.apply(kernel, desired, mode.baseline())?;
        hook_events.extend(ctx.hook.ensure_attached(kernel)?);
        Ok((apply, hook_events))
    }
}
