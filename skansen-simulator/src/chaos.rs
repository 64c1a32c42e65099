//! ## skansen-simulator::chaos
//! **Seeded out-of-band kernel drift and write faults**
//!
//! Everything here happens behind the engine's back: other tools deleting
//! entries, flushing maps, unloading or replacing the XDP program, or the
//! kernel refusing a write halfway through a cycle.

use std::net::{IpAddr, Ipv4Addr};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use skansen_core::{BlockEntry, IpFamily};
use skansen_prevention::MemoryKernel;
use tracing::debug;

use crate::config::ChaosConfig;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum InjectedFault {
    EntryDeleted { interface: String, entry: BlockEntry },
    EntryInserted { interface: String, entry: BlockEntry },
    TableDeleted { interface: String, family: IpFamily },
    ProgramDetached { interface: String },
    ForeignAttached { interface: String },
    WriteFailure { after: usize },
    AttachFailure,
}

pub struct DriftInjector {
    rng: StdRng,
    config: ChaosConfig,
}

impl DriftInjector {
    pub fn new(seed: u64, config: ChaosConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            config,
        }
    }

    /// Rolls for one fault and, if it hits, applies it to `kernel`.
    pub fn inject(&mut self, kernel: &MemoryKernel, interfaces: &[String]) -> Option<InjectedFault> {
        if interfaces.is_empty() || !self.rng.random_bool(self.config.fault_probability) {
            return None;
        }
        let interface = interfaces[self.rng.random_range(0..interfaces.len())].clone();

        let fault = match self.rng.random_range(0..7u8) {
            0 => {
                let present: Vec<BlockEntry> = IpFamily::ALL
                    .iter()
                    .filter_map(|f| kernel.table(&interface, *f))
                    .flatten()
                    .collect();
                if present.is_empty() {
                    return None;
                }
                let entry = present[self.rng.random_range(0..present.len())];
                kernel.external_delete_entry(&interface, &entry);
                InjectedFault::EntryDeleted { interface, entry }
            }
            1 => {
                // 198.18.0.0/15 is never part of generated policy.
                let addr = Ipv4Addr::new(198, 18, self.rng.random(), self.rng.random());
                let entry = BlockEntry::host(IpAddr::V4(addr));
                kernel.external_insert_entry(&interface, entry);
                InjectedFault::EntryInserted { interface, entry }
            }
            2 => {
                let family = IpFamily::ALL[self.rng.random_range(0..IpFamily::ALL.len())];
                if !kernel.external_delete_table(&interface, family) {
                    return None;
                }
                InjectedFault::TableDeleted { interface, family }
            }
            3 => {
                kernel.external_detach(&interface)?;
                InjectedFault::ProgramDetached { interface }
            }
            4 => {
                kernel.attach_foreign(&interface, "xdp_foreign");
                InjectedFault::ForeignAttached { interface }
            }
            5 => {
                let after = self.rng.random_range(0..4usize);
                kernel.fail_write_after(after);
                InjectedFault::WriteFailure { after }
            }
            _ => {
                kernel.fail_attaches(1);
                InjectedFault::AttachFailure
            }
        };
        debug!(?fault, "Injected fault");
        Some(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always() -> ChaosConfig {
        ChaosConfig {
            fault_probability: 1.0,
            ..ChaosConfig::default()
        }
    }

    #[test]
    fn zero_probability_never_fires() {
        let kernel = MemoryKernel::default();
        let mut injector = DriftInjector::new(
            1,
            ChaosConfig {
                fault_probability: 0.0,
                ..ChaosConfig::default()
            },
        );
        let ifaces = vec!["eth0".to_string()];
        for _ in 0..100 {
            assert!(injector.inject(&kernel, &ifaces).is_none());
        }
        assert!(kernel.ops().is_empty());
    }

    #[test]
    fn same_seed_same_faults() {
        let ifaces = vec!["eth0".to_string(), "eth1".to_string()];
        let run = |seed| {
            let kernel = MemoryKernel::default();
            let mut injector = DriftInjector::new(seed, always());
            (0..50)
                .map(|_| injector.inject(&kernel, &ifaces))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn inserted_entries_come_from_the_benchmark_range() {
        let kernel = MemoryKernel::default();
        let mut injector = DriftInjector::new(3, always());
        let ifaces = vec!["eth0".to_string()];
        let range: BlockEntry = "198.18.0.0/15".parse().unwrap();
        for _ in 0..200 {
            if let Some(InjectedFault::EntryInserted { entry, .. }) = injector.inject(&kernel, &ifaces) {
                assert!(range.contains(entry.addr()));
            }
        }
    }
}
