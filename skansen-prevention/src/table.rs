//! ## skansen-prevention::table
//! **Block-Table Manager: minimal diffs between applied and desired entries**
//!
//! All inserts of a cycle go out before any remove, across both families, so
//! a failure part-way can only leave extra denies behind, never a gap. A
//! failed cycle commits nothing: `last_applied` keeps describing the last
//! cycle that completed.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use skansen_core::{BlockEntry, DesiredState, IpFamily, TableDiff};
use tracing::{debug, trace};

use crate::error::{ApplyStage, PreventionError};
use crate::kernel::XdpKernel;

/// What a diff is computed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    /// The entries this manager last applied. No kernel reads.
    LastApplied,
    /// The entries the kernel actually holds. Heals external edits.
    Kernel,
}

/// Divergence between the kernel and what was last applied, found while
/// reading back tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableDrift {
    EntryMissing { family: IpFamily, entry: BlockEntry },
    EntryUnexpected { family: IpFamily, entry: BlockEntry },
    TableMissing { family: IpFamily },
}

impl TableDrift {
    pub fn kind(&self) -> &'static str {
        match self {
            TableDrift::EntryMissing { .. } => "entry_missing",
            TableDrift::EntryUnexpected { .. } => "entry_unexpected",
            TableDrift::TableMissing { .. } => "table_missing",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub inserted: usize,
    pub removed: usize,
    pub destroyed: Vec<IpFamily>,
    pub drift: Vec<TableDrift>,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.removed == 0 && self.destroyed.is_empty()
    }
}

/// Per-interface table bookkeeping.
#[derive(Debug)]
pub struct BlockTableManager {
    interface: String,
    last_applied: BTreeMap<IpFamily, BTreeSet<BlockEntry>>,
    /// Set after the first successful apply. Before that, whatever the
    /// kernel holds is leftover state, not drift.
    primed: bool,
}

struct FamilyPlan {
    family: IpFamily,
    diff: TableDiff,
    destroy: bool,
}

impl BlockTableManager {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            last_applied: BTreeMap::new(),
            primed: false,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn last_applied(&self, family: IpFamily) -> BTreeSet<BlockEntry> {
        self.last_applied.get(&family).cloned().unwrap_or_default()
    }

    pub fn entry_counts(&self) -> BTreeMap<IpFamily, usize> {
        self.last_applied
            .iter()
            .map(|(family, entries)| (*family, entries.len()))
            .collect()
    }

    pub fn has_entries(&self) -> bool {
        self.last_applied.values().any(|e| !e.is_empty())
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Brings the kernel tables of this interface to `desired`.
    ///
    /// Families whose desired set is empty have their table destroyed.
    pub fn apply(
        &mut self,
        kernel: &dyn XdpKernel,
        desired: &DesiredState,
        baseline: Baseline,
    ) -> Result<ApplyReport, PreventionError> {
        let mut report = ApplyReport::default();
        let plans = self.plan(kernel, desired, baseline, &mut report)?;

        for plan in &plans {
            for entry in &plan.diff.to_add {
                trace!(interface = %self.interface, entry = %entry, key = %entry.key_hex(), "insert");
                kernel
                    .table_insert(&self.interface, entry)
                    .map_err(|source| self.failed(plan.family, ApplyStage::Insert(*entry), source))?;
                report.inserted += 1;
            }
        }
        for plan in &plans {
            for entry in &plan.diff.to_remove {
                trace!(interface = %self.interface, entry = %entry, key = %entry.key_hex(), "remove");
                kernel
                    .table_remove(&self.interface, entry)
                    .map_err(|source| self.failed(plan.family, ApplyStage::Remove(*entry), source))?;
                report.removed += 1;
            }
        }
        for plan in plans.iter().filter(|p| p.destroy) {
            kernel
                .table_destroy(&self.interface, plan.family)
                .map_err(|source| self.failed(plan.family, ApplyStage::Destroy, source))?;
            report.destroyed.push(plan.family);
        }

        self.last_applied = desired
            .families()
            .map(|family| (family, desired.family(family)))
            .collect();
        self.primed = true;

        if !report.is_noop() {
            debug!(
                interface = %self.interface,
                inserted = report.inserted,
                removed = report.removed,
                destroyed = ?report.destroyed,
                "Block table updated"
            );
        }
        Ok(report)
    }

    fn plan(
        &self,
        kernel: &dyn XdpKernel,
        desired: &DesiredState,
        baseline: Baseline,
        report: &mut ApplyReport,
    ) -> Result<Vec<FamilyPlan>, PreventionError> {
        let mut plans = Vec::new();
        for family in IpFamily::ALL {
            let want = desired.family(family);
            let applied = self.last_applied(family);
            let (base, table_exists) = match baseline {
                Baseline::LastApplied => {
                    let exists = !applied.is_empty();
                    (applied.clone(), exists)
                }
                Baseline::Kernel => {
                    let actual = kernel
                        .table_entries(&self.interface, family)
                        .map_err(|source| self.failed(family, ApplyStage::Read, source))?;
                    let exists = actual.is_some();
                    let actual = actual.unwrap_or_default();
                    if self.primed {
                        self.record_drift(family, &applied, &actual, exists, report);
                    }
                    (actual, exists)
                }
            };

            let diff = TableDiff::between(&base, &want);
            let destroy = want.is_empty() && table_exists;
            if !diff.is_empty() || destroy {
                plans.push(FamilyPlan {
                    family,
                    diff,
                    destroy,
                });
            }
        }
        Ok(plans)
    }

    fn record_drift(
        &self,
        family: IpFamily,
        applied: &BTreeSet<BlockEntry>,
        actual: &BTreeSet<BlockEntry>,
        exists: bool,
        report: &mut ApplyReport,
    ) {
        if !exists && !applied.is_empty() {
            report.drift.push(TableDrift::TableMissing { family });
            return;
        }
        for entry in applied.difference(actual) {
            report.drift.push(TableDrift::EntryMissing {
                family,
                entry: *entry,
            });
        }
        for entry in actual.difference(applied) {
            report.drift.push(TableDrift::EntryUnexpected {
                family,
                entry: *entry,
            });
        }
    }

    fn failed(
        &self,
        family: IpFamily,
        stage: ApplyStage,
        source: crate::error::KernelError,
    ) -> PreventionError {
        PreventionError::ApplyFailed {
            interface: self.interface.clone(),
            family,
            stage,
            source,
        }
    }
}
