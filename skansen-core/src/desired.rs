//! Per-interface desired state and the diff between two entry sets.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::entry::BlockEntry;
use crate::family::IpFamily;

/// Entries one interface should carry, grouped by family.
///
/// Only non-empty families are stored, so `is_empty` means "no program
/// should be attached".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DesiredState {
    tables: BTreeMap<IpFamily, BTreeSet<BlockEntry>>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: BlockEntry) -> bool {
        self.tables.entry(entry.family()).or_default().insert(entry)
    }

    /// Replaces the entries of one family. An empty set drops the family.
    pub fn set_family(&mut self, family: IpFamily, entries: BTreeSet<BlockEntry>) {
        debug_assert!(entries.iter().all(|e| e.family() == family));
        if entries.is_empty() {
            self.tables.remove(&family);
        } else {
            self.tables.insert(family, entries);
        }
    }

    /// Entries for `family`; empty when the family has none.
    pub fn family(&self, family: IpFamily) -> BTreeSet<BlockEntry> {
        self.tables.get(&family).cloned().unwrap_or_default()
    }

    pub fn families(&self) -> impl Iterator<Item = IpFamily> + '_ {
        self.tables.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeSet::is_empty)
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockEntry> {
        self.tables.values().flatten()
    }
}

impl FromIterator<BlockEntry> for DesiredState {
    fn from_iter<I: IntoIterator<Item = BlockEntry>>(iter: I) -> Self {
        let mut state = DesiredState::new();
        for entry in iter {
            state.insert(entry);
        }
        state
    }
}

/// Writes needed to move a table from `baseline` to `desired`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableDiff {
    pub to_add: BTreeSet<BlockEntry>,
    pub to_remove: BTreeSet<BlockEntry>,
}

impl TableDiff {
    pub fn between(baseline: &BTreeSet<BlockEntry>, desired: &BTreeSet<BlockEntry>) -> Self {
        Self {
            to_add: desired.difference(baseline).copied().collect(),
            to_remove: baseline.difference(desired).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }
}
