//! ## skansen-core::policy
//! **Declarative deny-list policy: labeled address sets and selector rules**
//!
//! A `PolicyDocument` is the on-disk form; a `PolicySnapshot` is the keyed view
//! the engine queries and diffs. Snapshots change only through `PolicyEvent`s,
//! which is also what the event bus carries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::family::IpFamily;

/// Named, labeled collection of prefixes.
///
/// `nets` are kept as written; they are normalized (and bad ones dropped)
/// during translation so one typo never hides the rest of the set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedAddressSet {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub nets: Vec<String>,
}

/// Deny every source prefix from sets matched by `source_selector` on
/// `interface`, for one family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRule {
    pub name: String,
    pub interface: String,
    #[serde(default)]
    pub family: IpFamily,
    pub source_selector: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub address_sets: Vec<NamedAddressSet>,
    #[serde(default)]
    pub rules: Vec<BlockRule>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyEvent {
    AddressSetUpserted(NamedAddressSet),
    AddressSetRemoved(String),
    RuleUpserted(BlockRule),
    RuleRemoved(String),
}

impl PolicyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyEvent::AddressSetUpserted(_) => "address_set_upserted",
            PolicyEvent::AddressSetRemoved(_) => "address_set_removed",
            PolicyEvent::RuleUpserted(_) => "rule_upserted",
            PolicyEvent::RuleRemoved(_) => "rule_removed",
        }
    }
}

/// Current policy, keyed by name. Later duplicates in a document win.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicySnapshot {
    address_sets: BTreeMap<String, NamedAddressSet>,
    rules: BTreeMap<String, BlockRule>,
}

impl PolicySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address_sets(&self) -> impl Iterator<Item = &NamedAddressSet> {
        self.address_sets.values()
    }

    pub fn address_set(&self, name: &str) -> Option<&NamedAddressSet> {
        self.address_sets.get(name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &BlockRule> {
        self.rules.values()
    }

    pub fn rule(&self, name: &str) -> Option<&BlockRule> {
        self.rules.get(name)
    }

    /// Rules that target `interface`.
    pub fn rules_for<'a>(&'a self, interface: &'a str) -> impl Iterator<Item = &'a BlockRule> {
        self.rules.values().filter(move |r| r.interface == interface)
    }

    /// Interfaces named by at least one rule.
    pub fn interfaces(&self) -> BTreeSet<String> {
        self.rules.values().map(|r| r.interface.clone()).collect()
    }

    /// Applies `event` and returns the interfaces whose desired state may
    /// have changed.
    ///
    /// Address-set changes can affect any rule, so they report every
    /// interface that had or has a rule.
    pub fn apply(&mut self, event: PolicyEvent) -> BTreeSet<String> {
        match event {
            PolicyEvent::AddressSetUpserted(set) => {
                if self.address_sets.get(&set.name) == Some(&set) {
                    return BTreeSet::new();
                }
                self.address_sets.insert(set.name.clone(), set);
                self.interfaces()
            }
            PolicyEvent::AddressSetRemoved(name) => match self.address_sets.remove(&name) {
                Some(_) => self.interfaces(),
                None => BTreeSet::new(),
            },
            PolicyEvent::RuleUpserted(rule) => {
                let mut affected = BTreeSet::new();
                if let Some(old) = self.rules.get(&rule.name) {
                    if old == &rule {
                        return affected;
                    }
                    affected.insert(old.interface.clone());
                }
                affected.insert(rule.interface.clone());
                self.rules.insert(rule.name.clone(), rule);
                affected
            }
            PolicyEvent::RuleRemoved(name) => self
                .rules
                .remove(&name)
                .map(|old| old.interface)
                .into_iter()
                .collect(),
        }
    }

    /// Events that turn `self` into `next`. Removals come first so that a
    /// rename never leaves two copies of a rule in between.
    pub fn diff(&self, next: &PolicySnapshot) -> Vec<PolicyEvent> {
        let mut events = Vec::new();
        for name in self.rules.keys() {
            if !next.rules.contains_key(name) {
                events.push(PolicyEvent::RuleRemoved(name.clone()));
            }
        }
        for name in self.address_sets.keys() {
            if !next.address_sets.contains_key(name) {
                events.push(PolicyEvent::AddressSetRemoved(name.clone()));
            }
        }
        for (name, set) in &next.address_sets {
            if self.address_sets.get(name) != Some(set) {
                events.push(PolicyEvent::AddressSetUpserted(set.clone()));
            }
        }
        for (name, rule) in &next.rules {
            if self.rules.get(name) != Some(rule) {
                events.push(PolicyEvent::RuleUpserted(rule.clone()));
            }
        }
        events
    }

    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            address_sets: self.address_sets.values().cloned().collect(),
            rules: self.rules.values().cloned().collect(),
        }
    }
}

impl From<PolicyDocument> for PolicySnapshot {
    fn from(doc: PolicyDocument) -> Self {
        Self {
            address_sets: doc
                .address_sets
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            rules: doc.rules.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }
}
