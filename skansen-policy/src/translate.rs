//! ## skansen-policy::translate
//! **Prefix Translator: selector + named sets → normalized block entries**
//!
//! Output is a set, so duplicates across sets collapse and order never
//! matters. Prefixes of the other family are not an error; a v4 rule simply
//! ignores v6 members of a matched set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use skansen_core::{BlockEntry, CoreError, DesiredState, IpFamily, NamedAddressSet, PolicySnapshot};
use thiserror::Error;
use tracing::{debug, warn};

use crate::selector::{parse_selector, Selector, SelectorError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("Rule '{rule}' has an invalid selector: {source}")]
    InvalidSelector {
        rule: String,
        #[source]
        source: SelectorError,
    },
}

/// A set member that could not be turned into an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPrefix {
    pub set: String,
    pub raw: String,
    pub reason: CoreError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    pub entries: BTreeSet<BlockEntry>,
    pub matched_sets: Vec<String>,
    pub skipped: Vec<SkippedPrefix>,
}

/// Parses selectors once and reuses them across cycles.
#[derive(Default)]
pub struct PrefixTranslator {
    compiled: RwLock<HashMap<String, Arc<Selector>>>,
}

impl PrefixTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached parse of `selector`.
    pub fn selector_compile(&self, selector: &str) -> Result<Arc<Selector>, SelectorError> {
        if let Some(parsed) = self.compiled.read().get(selector) {
            return Ok(Arc::clone(parsed));
        }
        let parsed = Arc::new(parse_selector(selector)?);
        self.compiled
            .write()
            .insert(selector.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Union of the `family` prefixes of every set whose labels satisfy
    /// `selector`.
    pub fn translate<'a>(
        &self,
        selector: &Selector,
        sets: impl IntoIterator<Item = &'a NamedAddressSet>,
        family: IpFamily,
    ) -> Translation {
        let mut out = Translation::default();
        for set in sets {
            if !selector.matches(&set.labels) {
                continue;
            }
            out.matched_sets.push(set.name.clone());
            for raw in &set.nets {
                match raw.parse::<BlockEntry>() {
                    Ok(entry) if entry.family() == family => {
                        out.entries.insert(entry);
                    }
                    Ok(_) => {}
                    Err(reason) => out.skipped.push(SkippedPrefix {
                        set: set.name.clone(),
                        raw: raw.clone(),
                        reason,
                    }),
                }
            }
        }
        out
    }

    /// Desired state of `interface`: the union over every rule that names it.
    ///
    /// Any rule with a bad selector fails the whole interface, so a typo
    /// never shrinks the applied deny list.
    pub fn desired_state(
        &self,
        snapshot: &PolicySnapshot,
        interface: &str,
    ) -> Result<DesiredState, TranslateError> {
        let mut by_family: BTreeMap<IpFamily, BTreeSet<BlockEntry>> = BTreeMap::new();
        for rule in snapshot.rules_for(interface) {
            let selector = self.selector_compile(&rule.source_selector).map_err(|source| {
                TranslateError::InvalidSelector {
                    rule: rule.name.clone(),
                    source,
                }
            })?;
            let translation = self.translate(&selector, snapshot.address_sets(), rule.family);
            for skipped in &translation.skipped {
                warn!(
                    rule = %rule.name,
                    set = %skipped.set,
                    prefix = %skipped.raw,
                    error = %skipped.reason,
                    "Skipping unparseable prefix"
                );
            }
            debug!(
                rule = %rule.name,
                interface,
                family = %rule.family,
                sets = ?translation.matched_sets,
                entries = translation.entries.len(),
                "Rule translated"
            );
            by_family
                .entry(rule.family)
                .or_default()
                .extend(translation.entries);
        }

        let mut desired = DesiredState::new();
        for (family, entries) in by_family {
            desired.set_family(family, entries);
        }
        Ok(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skansen_core::{BlockRule, PolicyEvent};
    use tracing_test::traced_test;

    fn set(name: &str, labels: &[(&str, &str)], nets: &[&str]) -> NamedAddressSet {
        NamedAddressSet {
            name: name.into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            nets: nets.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn rule(name: &str, interface: &str, family: IpFamily, selector: &str) -> BlockRule {
        BlockRule {
            name: name.into(),
            interface: interface.into(),
            family,
            source_selector: selector.into(),
        }
    }

    fn snapshot(events: Vec<PolicyEvent>) -> PolicySnapshot {
        let mut snap = PolicySnapshot::new();
        for event in events {
            snap.apply(event);
        }
        snap
    }

    fn entries(list: &[&str]) -> BTreeSet<BlockEntry> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn unions_matching_sets_and_dedups() {
        let translator = PrefixTranslator::new();
        let sets = [
            set("a", &[("role", "blocked")], &["10.0.0.5", "10.1.2.3/8"]),
            set("b", &[("role", "blocked")], &["10.0.0.5/32", "fd00::1"]),
            set("c", &[("role", "partner")], &["172.16.0.1"]),
        ];
        let selector = parse_selector("role == 'blocked'").unwrap();
        let out = translator.translate(&selector, &sets, IpFamily::Ipv4);
        assert_eq!(out.entries, entries(&["10.0.0.5/32", "10.0.0.0/8"]));
        assert_eq!(out.matched_sets, vec!["a".to_string(), "b".to_string()]);

        let v6 = translator.translate(&selector, &sets, IpFamily::Ipv6);
        assert_eq!(v6.entries, entries(&["fd00::1/128"]));
    }

    #[traced_test]
    #[test]
    fn bad_prefix_is_skipped_with_warning() {
        let translator = PrefixTranslator::new();
        let snap = snapshot(vec![
            PolicyEvent::AddressSetUpserted(set("a", &[], &["10.0.0.5", "10.0.0.300"])),
            PolicyEvent::RuleUpserted(rule("r", "eth0", IpFamily::Ipv4, "all()")),
        ]);
        let desired = translator.desired_state(&snap, "eth0").unwrap();
        assert_eq!(desired.family(IpFamily::Ipv4), entries(&["10.0.0.5"]));
        assert!(logs_contain("Skipping unparseable prefix"));
    }

    #[test]
    fn invalid_selector_fails_interface() {
        let translator = PrefixTranslator::new();
        let snap = snapshot(vec![
            PolicyEvent::AddressSetUpserted(set("a", &[], &["10.0.0.5"])),
            PolicyEvent::RuleUpserted(rule("good", "eth0", IpFamily::Ipv4, "all()")),
            PolicyEvent::RuleUpserted(rule("bad", "eth0", IpFamily::Ipv4, "role ==")),
        ]);
        let err = translator.desired_state(&snap, "eth0").unwrap_err();
        assert!(matches!(err, TranslateError::InvalidSelector { ref rule, .. } if rule == "bad"));
    }

    #[test]
    fn overly_nested_selector_fails_only_its_interface() {
        let translator = PrefixTranslator::new();
        let nested = format!("{}all()", "!".repeat(100_000));
        let snap = snapshot(vec![
            PolicyEvent::AddressSetUpserted(set("a", &[], &["10.0.0.5"])),
            PolicyEvent::RuleUpserted(rule("deep", "eth0", IpFamily::Ipv4, &nested)),
            PolicyEvent::RuleUpserted(rule("plain", "eth1", IpFamily::Ipv4, "all()")),
        ]);
        let err = translator.desired_state(&snap, "eth0").unwrap_err();
        assert!(matches!(
            err,
            TranslateError::InvalidSelector { source: SelectorError::TooDeep { .. }, .. }
        ));
        let eth1 = translator.desired_state(&snap, "eth1").unwrap();
        assert_eq!(eth1.family(IpFamily::Ipv4), entries(&["10.0.0.5"]));
    }

    #[test]
    fn interface_state_spans_rules_and_families() {
        let translator = PrefixTranslator::new();
        let snap = snapshot(vec![
            PolicyEvent::AddressSetUpserted(set("a", &[("t", "1")], &["10.0.0.5", "fd00::/64"])),
            PolicyEvent::AddressSetUpserted(set("b", &[("t", "2")], &["192.168.0.0/16"])),
            PolicyEvent::RuleUpserted(rule("r1", "eth0", IpFamily::Ipv4, "t == '1'")),
            PolicyEvent::RuleUpserted(rule("r2", "eth0", IpFamily::Ipv4, "t == '2'")),
            PolicyEvent::RuleUpserted(rule("r3", "eth0", IpFamily::Ipv6, "has(t)")),
            PolicyEvent::RuleUpserted(rule("r4", "eth1", IpFamily::Ipv4, "all()")),
        ]);
        let desired = translator.desired_state(&snap, "eth0").unwrap();
        assert_eq!(
            desired.family(IpFamily::Ipv4),
            entries(&["10.0.0.5", "192.168.0.0/16"])
        );
        assert_eq!(desired.family(IpFamily::Ipv6), entries(&["fd00::/64"]));

        assert!(translator.desired_state(&snap, "eth9").unwrap().is_empty());
    }

    #[test]
    fn no_matching_set_yields_empty_state() {
        let translator = PrefixTranslator::new();
        let snap = snapshot(vec![
            PolicyEvent::AddressSetUpserted(set("a", &[("t", "1")], &["10.0.0.5"])),
            PolicyEvent::RuleUpserted(rule("r", "eth0", IpFamily::Ipv4, "t == '2'")),
        ]);
        assert!(translator.desired_state(&snap, "eth0").unwrap().is_empty());
    }

    #[test]
    fn compiled_selectors_are_cached() {
        let translator = PrefixTranslator::new();
        let a = translator.selector_compile("all()").unwrap();
        let b = translator.selector_compile("all()").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(translator.selector_compile("").is_err());
    }
}
