//! ## skansen-prevention::memory
//! **In-process XDP model for tests, simulation and dry runs**
//!
//! Behaves like the kernel from the control plane's point of view: program
//! ids are assigned on attach, tables appear on first insert, attaching over
//! an existing program fails. On top of that it can be tampered with the way
//! an operator with `bpftool` or `ip link` would, and it can be told to fail.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use skansen_common::PROGRAM_NAME;
use skansen_core::{BlockEntry, IpFamily, PacketMeta};

use crate::error::KernelError;
use crate::failsafe::FailsafeFilter;
use crate::kernel::{ProbeOutcome, ProgramInfo, XdpKernel};

const FIRST_PROGRAM_ID: u32 = 100;
/// Oldest calls fall out of the log past this many.
pub const OP_LOG_CAPACITY: usize = 4096;

/// A call made through [`XdpKernel`]. The most recent ones are kept, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelOp {
    Probe(String),
    Query(String),
    Attach(String, u32),
    Detach(String, u32),
    Read(String, IpFamily),
    Insert(String, BlockEntry),
    Remove(String, BlockEntry),
    Destroy(String, IpFamily),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

#[derive(Default)]
struct InterfaceModel {
    program: Option<ProgramInfo>,
    tables: BTreeMap<IpFamily, BTreeSet<BlockEntry>>,
}

#[derive(Default)]
struct Faults {
    /// Writes (insert/remove/destroy) left to succeed before the next one fails.
    write_fail_after: Option<usize>,
    writes_to_fail: usize,
    reads_to_fail: usize,
    attaches_to_fail: usize,
    detaches_to_fail: usize,
    call_delay: Option<Duration>,
}

struct MemoryState {
    interfaces: BTreeMap<String, InterfaceModel>,
    /// `None` means every interface name exists.
    known: Option<BTreeSet<String>>,
    unsupported: BTreeMap<String, String>,
    next_program_id: u32,
    faults: Faults,
    ops: VecDeque<KernelOp>,
}

impl MemoryState {
    fn record(&mut self, op: KernelOp) {
        if self.ops.len() == OP_LOG_CAPACITY {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }

    fn check_exists(&self, interface: &str) -> Result<(), KernelError> {
        match &self.known {
            Some(known) if !known.contains(interface) => {
                Err(KernelError::NoSuchInterface(interface.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn model(&mut self, interface: &str) -> &mut InterfaceModel {
        self.interfaces.entry(interface.to_string()).or_default()
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_program_id;
        self.next_program_id += 1;
        id
    }

    fn write_fault(&mut self) -> Option<KernelError> {
        if let Some(after) = self.faults.write_fail_after {
            if after == 0 {
                self.faults.write_fail_after = None;
                self.faults.writes_to_fail = self.faults.writes_to_fail.max(1);
            } else {
                self.faults.write_fail_after = Some(after - 1);
            }
        }
        if self.faults.writes_to_fail > 0 {
            self.faults.writes_to_fail -= 1;
            return Some(KernelError::Write("injected write failure".into()));
        }
        None
    }
}

pub struct MemoryKernel {
    state: Mutex<MemoryState>,
    failsafe: FailsafeFilter,
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::new(FailsafeFilter::default())
    }
}

impl MemoryKernel {
    pub fn new(failsafe: FailsafeFilter) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                interfaces: BTreeMap::new(),
                known: None,
                unsupported: BTreeMap::new(),
                next_program_id: FIRST_PROGRAM_ID,
                faults: Faults::default(),
                ops: VecDeque::new(),
            }),
            failsafe,
        }
    }

    /// Restricts the set of existing interfaces.
    pub fn with_interfaces<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().known = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Makes the capability probe fail for `interface`.
    pub fn mark_unsupported(&self, interface: &str, reason: &str) {
        self.state
            .lock()
            .unsupported
            .insert(interface.to_string(), reason.to_string());
    }

    // ---- packet path ----

    /// Longest prefix in `interface`'s table covering `addr`.
    pub fn lookup(&self, interface: &str, addr: IpAddr) -> Option<BlockEntry> {
        let state = self.state.lock();
        state
            .interfaces
            .get(interface)?
            .tables
            .get(&IpFamily::of(&addr))?
            .iter()
            .filter(|e| e.contains(addr))
            .max_by_key(|e| e.prefix_len())
            .copied()
    }

    /// What the attached program would do with `packet`. Without our
    /// program attached nothing is dropped.
    pub fn evaluate(&self, interface: &str, packet: &PacketMeta) -> Verdict {
        let attached = self
            .program(interface)
            .is_some_and(|p| p.is_ours());
        if !attached || self.failsafe.permits(packet) {
            return Verdict::Pass;
        }
        match self.lookup(interface, packet.src) {
            Some(_) => Verdict::Drop,
            None => Verdict::Pass,
        }
    }

    // ---- inspection ----

    pub fn program(&self, interface: &str) -> Option<ProgramInfo> {
        self.state
            .lock()
            .interfaces
            .get(interface)
            .and_then(|m| m.program.clone())
    }

    pub fn table(&self, interface: &str, family: IpFamily) -> Option<BTreeSet<BlockEntry>> {
        self.state
            .lock()
            .interfaces
            .get(interface)
            .and_then(|m| m.tables.get(&family).cloned())
    }

    pub fn has_any_table(&self, interface: &str) -> bool {
        self.state
            .lock()
            .interfaces
            .get(interface)
            .is_some_and(|m| !m.tables.is_empty())
    }

    pub fn ops(&self) -> Vec<KernelOp> {
        self.state.lock().ops.iter().cloned().collect()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    // ---- external drift ----

    /// Deletes one entry behind the control plane's back.
    pub fn external_delete_entry(&self, interface: &str, entry: &BlockEntry) -> bool {
        let mut state = self.state.lock();
        state
            .interfaces
            .get_mut(interface)
            .and_then(|m| m.tables.get_mut(&entry.family()))
            .is_some_and(|t| t.remove(entry))
    }

    /// Inserts an entry behind the control plane's back.
    pub fn external_insert_entry(&self, interface: &str, entry: BlockEntry) {
        let mut state = self.state.lock();
        state
            .model(interface)
            .tables
            .entry(entry.family())
            .or_default()
            .insert(entry);
    }

    pub fn external_delete_table(&self, interface: &str, family: IpFamily) -> bool {
        let mut state = self.state.lock();
        state
            .interfaces
            .get_mut(interface)
            .is_some_and(|m| m.tables.remove(&family).is_some())
    }

    /// Detaches whatever is attached, the way `ip link set dev X xdp off` would.
    pub fn external_detach(&self, interface: &str) -> Option<ProgramInfo> {
        let mut state = self.state.lock();
        state.interfaces.get_mut(interface)?.program.take()
    }

    /// Attaches some other program, replacing ours if present.
    pub fn attach_foreign(&self, interface: &str, name: &str) -> ProgramInfo {
        let mut state = self.state.lock();
        let program = ProgramInfo {
            id: state.next_id(),
            name: name.to_string(),
        };
        state.model(interface).program = Some(program.clone());
        program
    }

    // ---- fault injection ----

    /// Lets `after` more writes succeed, then fails the next one.
    pub fn fail_write_after(&self, after: usize) {
        self.state.lock().faults.write_fail_after = Some(after);
    }

    /// Fails the next `count` writes.
    pub fn fail_writes(&self, count: usize) {
        self.state.lock().faults.writes_to_fail = count;
    }

    pub fn fail_reads(&self, count: usize) {
        self.state.lock().faults.reads_to_fail = count;
    }

    pub fn fail_attaches(&self, count: usize) {
        self.state.lock().faults.attaches_to_fail = count;
    }

    pub fn fail_detaches(&self, count: usize) {
        self.state.lock().faults.detaches_to_fail = count;
    }

    /// Makes every call block for `delay`, to exercise cycle timeouts.
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        self.state.lock().faults.call_delay = delay;
    }

    /// Disarms every pending injected failure and delay.
    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    fn delay(&self) {
        let delay = self.state.lock().faults.call_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl XdpKernel for MemoryKernel {
    fn probe(&self, interface: &str) -> Result<ProbeOutcome, KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.record(KernelOp::Probe(interface.to_string()));
        state.check_exists(interface)?;
        Ok(match state.unsupported.get(interface) {
            Some(reason) => ProbeOutcome::Unsupported(reason.clone()),
            None => ProbeOutcome::Supported,
        })
    }

    fn query_program(&self, interface: &str) -> Result<Option<ProgramInfo>, KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.record(KernelOp::Query(interface.to_string()));
        state.check_exists(interface)?;
        Ok(state
            .interfaces
            .get(interface)
            .and_then(|m| m.program.clone()))
    }

    fn attach(&self, interface: &str) -> Result<ProgramInfo, KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.check_exists(interface)?;
        if state.faults.attaches_to_fail > 0 {
            state.faults.attaches_to_fail -= 1;
            return Err(KernelError::Program("injected attach failure".into()));
        }
        if let Some(existing) = state.interfaces.get(interface).and_then(|m| m.program.as_ref()) {
            return Err(KernelError::Program(format!(
                "program {} already attached",
                existing.id
            )));
        }
        let program = ProgramInfo {
            id: state.next_id(),
            name: PROGRAM_NAME.to_string(),
        };
        state.model(interface).program = Some(program.clone());
        state.record(KernelOp::Attach(interface.to_string(), program.id));
        Ok(program)
    }

    fn detach(&self, interface: &str, program: &ProgramInfo) -> Result<(), KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.check_exists(interface)?;
        if state.faults.detaches_to_fail > 0 {
            state.faults.detaches_to_fail -= 1;
            return Err(KernelError::Program("injected detach failure".into()));
        }
        let model = state.model(interface);
        match model.program.as_ref().map(|p| p.id) {
            Some(id) if id == program.id => model.program = None,
            Some(id) => {
                return Err(KernelError::Program(format!(
                    "program {} is attached, not {}",
                    id, program.id
                )))
            }
            None => {}
        }
        state.record(KernelOp::Detach(interface.to_string(), program.id));
        Ok(())
    }

    fn table_entries(
        &self,
        interface: &str,
        family: IpFamily,
    ) -> Result<Option<BTreeSet<BlockEntry>>, KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.record(KernelOp::Read(interface.to_string(), family));
        state.check_exists(interface)?;
        if state.faults.reads_to_fail > 0 {
            state.faults.reads_to_fail -= 1;
            return Err(KernelError::Read("injected read failure".into()));
        }
        Ok(state
            .interfaces
            .get(interface)
            .and_then(|m| m.tables.get(&family).cloned()))
    }

    fn table_insert(&self, interface: &str, entry: &BlockEntry) -> Result<(), KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.check_exists(interface)?;
        if let Some(err) = state.write_fault() {
            return Err(err);
        }
        state
            .model(interface)
            .tables
            .entry(entry.family())
            .or_default()
            .insert(*entry);
        state.record(KernelOp::Insert(interface.to_string(), *entry));
        Ok(())
    }

    fn table_remove(&self, interface: &str, entry: &BlockEntry) -> Result<(), KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.check_exists(interface)?;
        if let Some(err) = state.write_fault() {
            return Err(err);
        }
        if let Some(table) = state
            .interfaces
            .get_mut(interface)
            .and_then(|m| m.tables.get_mut(&entry.family()))
        {
            table.remove(entry);
        }
        state.record(KernelOp::Remove(interface.to_string(), *entry));
        Ok(())
    }

    fn table_destroy(&self, interface: &str, family: IpFamily) -> Result<(), KernelError> {
        self.delay();
        let mut state = self.state.lock();
        state.check_exists(interface)?;
        if let Some(err) = state.write_fault() {
            return Err(err);
        }
        if let Some(model) = state.interfaces.get_mut(interface) {
            model.tables.remove(&family);
        }
        state.record(KernelOp::Destroy(interface.to_string(), family));
        Ok(())
    }

    fn managed_interfaces(&self) -> Result<BTreeSet<String>, KernelError> {
        let state = self.state.lock();
        Ok(state
            .interfaces
            .iter()
            .filter(|(_, m)| {
                !m.tables.is_empty() || m.program.as_ref().is_some_and(ProgramInfo::is_ours)
            })
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skansen_core::failsafe::default_rules;

    fn entry(s: &str) -> BlockEntry {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn lookup_is_longest_prefix() {
        let kernel = MemoryKernel::default();
        kernel.table_insert("eth0", &entry("10.0.0.0/8")).unwrap();
        kernel.table_insert("eth0", &entry("10.1.0.0/16")).unwrap();
        assert_eq!(kernel.lookup("eth0", ip("10.1.2.3")), Some(entry("10.1.0.0/16")));
        assert_eq!(kernel.lookup("eth0", ip("10.2.0.1")), Some(entry("10.0.0.0/8")));
        assert_eq!(kernel.lookup("eth0", ip("11.0.0.1")), None);
        assert_eq!(kernel.lookup("eth0", ip("::1")), None);
    }

    #[test]
    fn verdicts_need_an_attached_program() {
        let kernel = MemoryKernel::new(FailsafeFilter::new(default_rules()));
        kernel.table_insert("eth0", &entry("0.0.0.0/0")).unwrap();
        let web = PacketMeta::tcp(ip("1.2.3.4"), ip("10.0.0.1"), 40000, 443);
        assert_eq!(kernel.evaluate("eth0", &web), Verdict::Pass);

        kernel.attach("eth0").unwrap();
        assert_eq!(kernel.evaluate("eth0", &web), Verdict::Drop);
        let ssh = PacketMeta::tcp(ip("1.2.3.4"), ip("10.0.0.1"), 40000, 22);
        assert_eq!(kernel.evaluate("eth0", &ssh), Verdict::Pass);
    }

    #[test]
    fn op_log_drops_the_oldest_calls() {
        let kernel = MemoryKernel::default();
        kernel.probe("first").unwrap();
        for _ in 0..OP_LOG_CAPACITY {
            kernel.query_program("eth0").unwrap();
        }
        let ops = kernel.ops();
        assert_eq!(ops.len(), OP_LOG_CAPACITY);
        assert!(!ops.contains(&KernelOp::Probe("first".into())));
    }

    #[test]
    fn attach_over_existing_program_fails() {
        let kernel = MemoryKernel::default();
        let first = kernel.attach("eth0").unwrap();
        assert_eq!(first.id, FIRST_PROGRAM_ID);
        assert!(first.is_ours());
        assert!(kernel.attach("eth0").is_err());
        kernel.detach("eth0", &first).unwrap();
        assert_eq!(kernel.attach("eth0").unwrap().id, FIRST_PROGRAM_ID + 1);
    }

    #[test]
    fn unknown_interface_is_rejected() {
        let kernel = MemoryKernel::default().with_interfaces(["eth0"]);
        assert!(kernel.attach("eth0").is_ok());
        assert_eq!(
            kernel.attach("eth9"),
            Err(KernelError::NoSuchInterface("eth9".into()))
        );
    }

    #[test]
    fn write_fault_fires_once_after_n_writes() {
        let kernel = MemoryKernel::default();
        kernel.fail_write_after(1);
        assert!(kernel.table_insert("eth0", &entry("10.0.0.1")).is_ok());
        assert!(kernel.table_insert("eth0", &entry("10.0.0.2")).is_err());
        assert!(kernel.table_insert("eth0", &entry("10.0.0.3")).is_ok());
        assert_eq!(kernel.table("eth0", IpFamily::Ipv4).unwrap().len(), 2);
    }

    #[test]
    fn drift_helpers_and_managed_interfaces() {
        let kernel = MemoryKernel::default();
        kernel.table_insert("eth0", &entry("10.0.0.5")).unwrap();
        kernel.attach("eth1").unwrap();
        kernel.attach_foreign("eth2", "xdp_dummy");
        let managed = kernel.managed_interfaces().unwrap();
        assert_eq!(managed.len(), 2);
        assert!(!managed.contains("eth2"));

        assert!(kernel.external_delete_entry("eth0", &entry("10.0.0.5")));
        assert!(!kernel.external_delete_entry("eth0", &entry("10.0.0.5")));
        assert!(kernel.external_detach("eth1").is_some());
        assert!(kernel.external_delete_table("eth0", IpFamily::Ipv4));
        assert!(kernel.managed_interfaces().unwrap().is_empty());
    }
}
