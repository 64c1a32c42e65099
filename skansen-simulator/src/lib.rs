/*!
# Skansen Simulator

Deterministic chaos runs of the sync engine against the in-memory kernel.
Every tick may churn the policy and inject one out-of-band fault, then runs
a resync cycle per interface and checks that each successful cycle left the
kernel exactly matching the desired state. The run ends with faults disarmed
and one clean tick, which must converge everywhere.

The same seed always yields the same fault sequence and the same final state
hash, so a failing seed can be replayed.

## Key Components:
- **Virtual Clock:** resync periods without wall-clock waits.
- **Drift Injector:** seeded out-of-band changes and write faults.
- **Policy churn:** seeded address set and rule edits.
*/

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use blake3::Hasher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use skansen_core::failsafe::default_rules;
use skansen_core::{
    BlockEntry, BlockRule, DesiredState, IpFamily, NamedAddressSet, PolicyEvent, PolicySnapshot,
};
use skansen_engine::{run_cycle, InterfaceContext, SyncError, SyncMode, SyncReport};
use skansen_policy::PrefixTranslator;
use skansen_prevention::{FailsafeFilter, MemoryKernel};
use tracing::{debug, info};

pub mod chaos;
pub mod config;
pub mod error;
pub mod virtual_clock;

pub use chaos::{DriftInjector, InjectedFault};
pub use config::{load_chaos_config, ChaosConfig, ChaosConfigError};
pub use error::SimulationError;
pub use virtual_clock::VirtualClock;

const ADDRESS_SETS: usize = 6;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub ticks: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub faults_injected: u64,
    pub drift_repaired: u64,
    pub policy_changes: u64,
    pub elapsed_secs: u64,
    pub state_hash: String,
}

pub struct Simulator {
    seed: u64,
    clock: VirtualClock,
    kernel: MemoryKernel,
    translator: PrefixTranslator,
    snapshot: PolicySnapshot,
    contexts: BTreeMap<String, InterfaceContext>,
    injector: DriftInjector,
    rng: StdRng,
    config: ChaosConfig,
    report: SimulationReport,
    state_hasher: Hasher,
}

impl Simulator {
    pub fn new(seed: u64, config: ChaosConfig) -> Self {
        let interfaces: Vec<String> = (0..config.interfaces).map(|i| format!("eth{i}")).collect();
        let kernel = MemoryKernel::new(FailsafeFilter::new(default_rules()))
            .with_interfaces(interfaces.iter().cloned());
        let contexts = interfaces
            .iter()
            .map(|name| (name.clone(), InterfaceContext::new(name.clone())))
            .collect();
        Self {
            seed,
            clock: VirtualClock::new(),
            kernel,
            translator: PrefixTranslator::new(),
            snapshot: PolicySnapshot::new(),
            contexts,
            // Separate streams so policy churn does not shift the fault sequence.
            injector: DriftInjector::new(seed, config.clone()),
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            config,
            report: SimulationReport {
                seed,
                ..SimulationReport::default()
            },
            state_hasher: Hasher::new(),
        }
    }

    pub fn kernel(&self) -> &MemoryKernel {
        &self.kernel
    }

    pub fn snapshot(&self) -> &PolicySnapshot {
        &self.snapshot
    }

    /// Runs `ticks` chaotic ticks followed by one clean convergence tick.
    pub fn run(&mut self, ticks: u64) -> Result<SimulationReport, SimulationError> {
        for tick in 0..ticks {
            self.churn_policy();
            let interfaces: Vec<String> = self.contexts.keys().cloned().collect();
            if let Some(fault) = self.injector.inject(&self.kernel, &interfaces) {
                self.report.faults_injected += 1;
                self.state_hasher.update(format!("{fault:?}").as_bytes());
            }
            for (interface, result) in self.resync_all() {
                match result {
                    Ok(report) => {
                        self.report.cycles_ok += 1;
                        self.count_repairs(&report);
                        self.check_converged(tick, &interface)?;
                    }
                    Err(err) => {
                        self.report.cycles_failed += 1;
                        debug!(tick, %interface, error = %err, "Cycle failed");
                    }
                }
            }
            self.clock.advance(self.config.period());
            self.report.ticks += 1;
        }

        self.kernel.clear_faults();
        for (interface, result) in self.resync_all() {
            if let Err(source) = result {
                return Err(SimulationError::NotConverged { interface, source });
            }
            self.check_converged(ticks, &interface)?;
        }

        self.hash_kernel_state();
        self.report.elapsed_secs = self.clock.now_ns() / 1_000_000_000;
        self.report.state_hash = hex::encode(self.state_hasher.finalize().as_bytes());
        info!(
            seed = self.seed,
            ticks = self.report.ticks,
            faults = self.report.faults_injected,
            repaired = self.report.drift_repaired,
            hash = %self.report.state_hash,
            "Simulation finished"
        );
        Ok(self.report.clone())
    }

    fn desired(&self, interface: &str) -> Result<DesiredState, SyncError> {
        Ok(self.translator.desired_state(&self.snapshot, interface)?)
    }

    fn resync_all(&mut self) -> Vec<(String, Result<SyncReport, SyncError>)> {
        let interfaces: Vec<String> = self.contexts.keys().cloned().collect();
        let mut outcomes = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            let result = match (self.desired(&interface), self.contexts.get_mut(&interface)) {
                (Ok(desired), Some(ctx)) => run_cycle(ctx, &self.kernel, &desired, SyncMode::Resync),
                (Err(err), _) => Err(err),
                (Ok(_), None) => Err(SyncError::Task(format!("unknown interface {interface}"))),
            };
            outcomes.push((interface, result));
        }
        outcomes
    }

    fn count_repairs(&mut self, report: &SyncReport) {
        let hook = report.hook_events.iter().filter(|e| e.is_drift()).count();
        self.report.drift_repaired += (report.apply.drift.len() + hook) as u64;
    }

    /// After a successful cycle: our program is attached iff there is
    /// something to block, and each table holds exactly its desired entries.
    fn check_converged(&self, tick: u64, interface: &str) -> Result<(), SimulationError> {
        let violated = |detail: String| SimulationError::InvariantViolated {
            tick,
            interface: interface.to_string(),
            detail,
        };
        let desired = self
            .translator
            .desired_state(&self.snapshot, interface)
            .map_err(|e| violated(e.to_string()))?;

        let ours = self.kernel.program(interface).is_some_and(|p| p.is_ours());
        if ours == desired.is_empty() {
            return Err(violated(format!(
                "program attached = {ours} with {} desired entries",
                desired.len()
            )));
        }
        for family in IpFamily::ALL {
            let want = desired.family(family);
            let have = self.kernel.table(interface, family);
            let matches = match &have {
                None => want.is_empty(),
                Some(have) => !want.is_empty() && *have == want,
            };
            if !matches {
                return Err(violated(format!(
                    "{family} table {:?} != desired {:?}",
                    have.map(|t| t.len()),
                    want.len()
                )));
            }
        }
        Ok(())
    }

    fn hash_kernel_state(&mut self) {
        for interface in self.contexts.keys() {
            self.state_hasher.update(interface.as_bytes());
            if let Some(program) = self.kernel.program(interface) {
                self.state_hasher.update(program.name.as_bytes());
            }
            for family in IpFamily::ALL {
                for entry in self.kernel.table(interface, family).unwrap_or_default() {
                    self.state_hasher.update(entry.key_hex().as_bytes());
                }
            }
        }
    }

    fn churn_policy(&mut self) {
        if !self.rng.random_bool(self.config.policy_churn_probability) {
            return;
        }
        let event = match self.rng.random_range(0..4u8) {
            0 | 1 => PolicyEvent::AddressSetUpserted(self.random_set()),
            2 => {
                let interface = format!("eth{}", self.rng.random_range(0..self.config.interfaces.max(1)));
                let family = if self.rng.random_bool(0.7) {
                    IpFamily::Ipv4
                } else {
                    IpFamily::Ipv6
                };
                let role = if self.rng.random_bool(0.5) { "scanner" } else { "botnet" };
                PolicyEvent::RuleUpserted(BlockRule {
                    name: format!("{interface}-{family}-{role}"),
                    interface,
                    family,
                    source_selector: format!("role == '{role}' && state != 'retired'"),
                })
            }
            _ => match self.snapshot.rules().next().map(|r| r.name.clone()) {
                Some(name) if self.rng.random_bool(0.5) => PolicyEvent::RuleRemoved(name),
                _ => PolicyEvent::AddressSetRemoved(format!(
                    "set-{}",
                    self.rng.random_range(0..ADDRESS_SETS)
                )),
            },
        };
        self.state_hasher.update(event.kind().as_bytes());
        let affected = self.snapshot.apply(event);
        self.report.policy_changes += 1;
        debug!(?affected, "Policy changed");
    }

    fn random_set(&mut self) -> NamedAddressSet {
        let index = self.rng.random_range(0..ADDRESS_SETS);
        let role = if self.rng.random_bool(0.5) { "scanner" } else { "botnet" };
        let state = if self.rng.random_bool(0.2) { "retired" } else { "active" };
        let nets = (0..self.rng.random_range(0..8usize))
            .map(|_| self.random_net())
            .collect();
        NamedAddressSet {
            name: format!("set-{index}"),
            labels: BTreeMap::from([
                ("role".to_string(), role.to_string()),
                ("state".to_string(), state.to_string()),
            ]),
            nets,
        }
    }

    fn random_net(&mut self) -> String {
        if self.rng.random_bool(0.75) {
            let addr = Ipv4Addr::new(10, self.rng.random(), self.rng.random(), 0);
            let len = self.rng.random_range(16..=32u8);
            BlockEntry::new(IpAddr::V4(addr), len)
                .map(|e| e.to_string())
                .unwrap_or_else(|_| addr.to_string())
        } else {
            let addr = Ipv6Addr::new(0x2001, 0xdb8, self.rng.random(), 0, 0, 0, 0, 1);
            format!("{addr}/{}", self.rng.random_range(32..=128u8))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_hash() {
        let a = Simulator::new(42, ChaosConfig::default()).run(200).unwrap();
        let b = Simulator::new(42, ChaosConfig::default()).run(200).unwrap();
        assert_eq!(a, b);
        assert!(!a.state_hash.is_empty());
    }

    #[test]
    fn different_seeds_diverge() {
        let a = Simulator::new(1, ChaosConfig::default()).run(100).unwrap();
        let b = Simulator::new(2, ChaosConfig::default()).run(100).unwrap();
        assert_ne!(a.state_hash, b.state_hash);
    }

    #[test]
    fn heavy_chaos_still_converges() {
        let config = ChaosConfig {
            interfaces: 4,
            fault_probability: 1.0,
            policy_churn_probability: 0.5,
            period_secs: 5,
        };
        let report = Simulator::new(7, config).run(300).unwrap();
        assert_eq!(report.ticks, 300);
        assert_eq!(report.elapsed_secs, 1500);
        assert!(report.faults_injected > 0);
        assert!(report.drift_repaired > 0);
    }

    #[test]
    fn calm_run_never_fails_a_cycle() {
        let config = ChaosConfig::default().calm();
        let report = Simulator::new(9, config).run(100).unwrap();
        assert_eq!(report.cycles_failed, 0);
        assert_eq!(report.faults_injected, 0);
    }

    #[test]
    fn no_policy_leaves_the_kernel_untouched() {
        let config = ChaosConfig {
            fault_probability: 0.0,
            policy_churn_probability: 0.0,
            ..ChaosConfig::default()
        };
        let mut sim = Simulator::new(5, config);
        sim.run(10).unwrap();
        for i in 0..3 {
            let iface = format!("eth{i}");
            assert!(sim.kernel().program(&iface).is_none());
            assert!(!sim.kernel().has_any_table(&iface));
        }
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]
            #[test]
            fn any_seed_converges(seed in any::<u64>()) {
                let config = ChaosConfig { fault_probability: 0.6, ..ChaosConfig::default() };
                prop_assert!(Simulator::new(seed, config).run(60).is_ok());
            }
        }
    }
}
