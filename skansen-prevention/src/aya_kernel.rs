//! ## skansen-prevention::aya_kernel
//! **Native XDP backend: aya for programs and maps, rtnetlink for link state**
//!
//! One `Ebpf` instance per interface. All maps of that instance are pinned
//! under `<pin_root>/<iface>/`, and the attachment is held by a pinned
//! `bpf_link`, so both the tables and the hook survive a restart of the
//! control plane and are reused by the next loader.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{HashMap as BpfHashMap, Map, MapData};
use aya::programs::links::{FdLink, PinnedLink};
use aya::programs::{loaded_programs, Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader};
use parking_lot::Mutex;
use skansen_common::{
    FailsafeKey, BLOCK_MAP_V4, BLOCK_MAP_V6, BLOCK_VALUE, FAILSAFE_MAP, PROGRAM_NAME,
};
use skansen_config::kernel::{KernelConfig, XdpMode};
use skansen_core::{BlockEntry, IpFamily};
use tracing::{debug, info, warn};

use crate::error::KernelError;
use crate::failsafe::FailsafeFilter;
use crate::kernel::{ProbeOutcome, ProgramInfo, XdpKernel};
use crate::netlink;

const LINK_PIN: &str = "link";

enum LoadError {
    /// Object missing or unreadable; worth retrying.
    Transient(String),
    /// The kernel refused the program itself.
    Refused(String),
}

/// What a table read should do with a loaded instance whose pin may be gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PinAction {
    /// No table for this family.
    Absent,
    Read,
    /// Pin vanished behind our back; restore it before reading.
    Repin,
}

/// Families whose table this process removed on purpose while the instance
/// stayed loaded for the other family or the link.
#[derive(Debug, Default)]
struct DestroyedTables(BTreeSet<(String, IpFamily)>);

impl DestroyedTables {
    fn mark(&mut self, interface: &str, family: IpFamily) {
        self.0.insert((interface.to_string(), family));
    }

    fn clear(&mut self, interface: &str, family: IpFamily) {
        self.0.remove(&(interface.to_string(), family));
    }

    fn forget_interface(&mut self, interface: &str) {
        self.0.retain(|(iface, _)| iface != interface);
    }

    fn pin_action(&self, interface: &str, family: IpFamily, loaded: bool, pin_exists: bool) -> PinAction {
        if pin_exists {
            return PinAction::Read;
        }
        if !loaded || self.0.contains(&(interface.to_string(), family)) {
            return PinAction::Absent;
        }
        PinAction::Repin
    }
}

pub struct AyaKernel {
    config: KernelConfig,
    failsafe: FailsafeFilter,
    loaded: Mutex<HashMap<String, Ebpf>>,
    destroyed: Mutex<DestroyedTables>,
}

impl AyaKernel {
    pub fn new(config: KernelConfig, failsafe: FailsafeFilter) -> Self {
        Self {
            config,
            failsafe,
            loaded: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(DestroyedTables::default()),
        }
    }

    fn pin_dir(&self, interface: &str) -> PathBuf {
        self.config.pin_dir(interface)
    }

    fn flags(&self) -> XdpFlags {
        match self.config.xdp_mode {
            XdpMode::Generic => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Offload => XdpFlags::HW_MODE,
        }
    }

    fn load(&self, interface: &str) -> Result<Ebpf, LoadError> {
        let object = self.config.resolve_bpf_object();
        let data = fs::read(&object)
            .map_err(|e| LoadError::Transient(format!("{}: {e}", object.display())))?;
        let pin_dir = self.pin_dir(interface);
        fs::create_dir_all(&pin_dir)
            .map_err(|e| LoadError::Transient(format!("{}: {e}", pin_dir.display())))?;

        let mut ebpf = EbpfLoader::new()
            .map_pin_path(&pin_dir)
            .set_max_entries(BLOCK_MAP_V4, self.config.max_entries)
            .set_max_entries(BLOCK_MAP_V6, self.config.max_entries)
            .load(&data)
            .map_err(|e| LoadError::Refused(e.to_string()))?;

        xdp_program(&mut ebpf)
            .map_err(|e| LoadError::Refused(e.to_string()))?
            .load()
            .map_err(|e| LoadError::Refused(e.to_string()))?;

        self.sync_failsafe(&mut ebpf)
            .map_err(|e| LoadError::Transient(e.to_string()))?;
        info!(interface, object = %object.display(), "XDP object loaded");
        Ok(ebpf)
    }

    /// Makes the pinned failsafe map hold exactly the configured rules.
    fn sync_failsafe(&self, ebpf: &mut Ebpf) -> Result<(), KernelError> {
        let map = ebpf
            .map_mut(FAILSAFE_MAP)
            .ok_or_else(|| KernelError::Program(format!("map {FAILSAFE_MAP} missing")))?;
        let mut ports: BpfHashMap<&mut MapData, FailsafeKey, u8> =
            BpfHashMap::try_from(map).map_err(|e| KernelError::Program(e.to_string()))?;

        let wanted: Vec<FailsafeKey> = self.failsafe.kernel_keys();
        let stale: Vec<FailsafeKey> = ports
            .keys()
            .filter_map(Result::ok)
            .filter(|k| !wanted.contains(k))
            .collect();
        for key in stale {
            ports
                .remove(&key)
                .map_err(|e| KernelError::Write(e.to_string()))?;
        }
        for key in wanted {
            ports
                .insert(key, 1, 0)
                .map_err(|e| KernelError::Write(e.to_string()))?;
        }
        Ok(())
    }

    /// Runs `f` against the loaded instance for `interface`, loading it
    /// first if needed.
    fn with_loaded<R>(
        &self,
        interface: &str,
        f: impl FnOnce(&mut Ebpf) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        let mut loaded = self.loaded.lock();
        if !loaded.contains_key(interface) {
            let ebpf = self.load(interface).map_err(|e| match e {
                LoadError::Transient(msg) | LoadError::Refused(msg) => KernelError::Program(msg),
            })?;
            loaded.insert(interface.to_string(), ebpf);
        }
        match loaded.get_mut(interface) {
            Some(ebpf) => f(ebpf),
            None => Err(KernelError::Program(format!("{interface} not loaded"))),
        }
    }

    fn table_pin(&self, interface: &str, family: IpFamily) -> PathBuf {
        self.pin_dir(interface).join(map_name(family))
    }

    /// Drops the instance and its leftover pins once neither a table nor a
    /// link remains.
    fn release_if_unused(&self, interface: &str) {
        let dir = self.pin_dir(interface);
        let busy = [BLOCK_MAP_V4, BLOCK_MAP_V6, LINK_PIN]
            .iter()
            .any(|name| dir.join(name).exists());
        if busy {
            return;
        }
        self.loaded.lock().remove(interface);
        self.destroyed.lock().forget_interface(interface);
        remove_pin(&dir.join(FAILSAFE_MAP));
        if let Err(e) = fs::remove_dir(&dir) {
            debug!(interface, error = %e, "Pin directory not removed");
        }
    }
}

impl XdpKernel for AyaKernel {
    fn probe(&self, interface: &str) -> Result<ProbeOutcome, KernelError> {
        netlink::if_index(interface)
            .map_err(|_| KernelError::NoSuchInterface(interface.to_string()))?;
        let mut loaded = self.loaded.lock();
        if loaded.contains_key(interface) {
            return Ok(ProbeOutcome::Supported);
        }
        match self.load(interface) {
            Ok(ebpf) => {
                loaded.insert(interface.to_string(), ebpf);
                Ok(ProbeOutcome::Supported)
            }
            Err(LoadError::Refused(reason)) => Ok(ProbeOutcome::Unsupported(reason)),
            Err(LoadError::Transient(msg)) => Err(KernelError::Program(msg)),
        }
    }

    fn query_program(&self, interface: &str) -> Result<Option<ProgramInfo>, KernelError> {
        let ifindex = netlink::if_index(interface)
            .map_err(|_| KernelError::NoSuchInterface(interface.to_string()))?;
        let Some(attached) =
            netlink::xdp_attachment(ifindex).map_err(|e| KernelError::Netlink(e.to_string()))?
        else {
            return Ok(None);
        };

        let name = loaded_programs()
            .filter_map(Result::ok)
            .find(|p| p.id() == attached.program_id)
            .and_then(|p| p.name_as_str().map(str::to_string))
            .unwrap_or_default();
        Ok(Some(ProgramInfo {
            id: attached.program_id,
            name,
        }))
    }

    fn attach(&self, interface: &str) -> Result<ProgramInfo, KernelError> {
        let flags = self.flags();
        let link_pin = self.pin_dir(interface).join(LINK_PIN);
        remove_pin(&link_pin);

        self.with_loaded(interface, |ebpf| {
            let program = xdp_program(ebpf)?;
            let link_id = program
                .attach(interface, flags)
                .map_err(|e| KernelError::Program(e.to_string()))?;
            let id = program
                .info()
                .map_err(|e| KernelError::Program(e.to_string()))?
                .id();

            let link = program
                .take_link(link_id)
                .map_err(|e| KernelError::Program(e.to_string()))?;
            match FdLink::try_from(link) {
                Ok(fd_link) => {
                    fd_link
                        .pin(&link_pin)
                        .map_err(|e| KernelError::Program(e.to_string()))?;
                }
                Err(e) => {
                    // Netlink attachment (no bpf_link support). It stays on
                    // the interface until cleared over rtnetlink.
                    debug!(interface, reason = %e, "Link not pinnable, keeping netlink attachment");
                }
            }
            Ok(ProgramInfo {
                id,
                name: PROGRAM_NAME.to_string(),
            })
        })
    }

    fn detach(&self, interface: &str, program: &ProgramInfo) -> Result<(), KernelError> {
        let link_pin = self.pin_dir(interface).join(LINK_PIN);
        if program.is_ours() && link_pin.exists() {
            let pinned = PinnedLink::from_pin(&link_pin)
                .map_err(|e| KernelError::Program(e.to_string()))?;
            let fd_link = pinned
                .unpin()
                .map_err(|e| KernelError::Program(e.to_string()))?;
            drop(fd_link);
        }

        let ifindex = netlink::if_index(interface)
            .map_err(|_| KernelError::NoSuchInterface(interface.to_string()))?;
        if let Some(attached) =
            netlink::xdp_attachment(ifindex).map_err(|e| KernelError::Netlink(e.to_string()))?
        {
            if attached.program_id == program.id {
                netlink::clear_xdp(ifindex, attached.mode_flags)
                    .map_err(|e| KernelError::Netlink(e.to_string()))?;
            }
        }
        self.release_if_unused(interface);
        Ok(())
    }

    fn table_entries(
        &self,
        interface: &str,
        family: IpFamily,
    ) -> Result<Option<BTreeSet<BlockEntry>>, KernelError> {
        let pin = self.table_pin(interface, family);
        let is_loaded = self.loaded.lock().contains_key(interface);
        let action = self
            .destroyed
            .lock()
            .pin_action(interface, family, is_loaded, pin.exists());
        if action == PinAction::Absent {
            return Ok(None);
        }
        self.with_loaded(interface, |ebpf| {
            if action == PinAction::Repin {
                warn!(interface, %family, "Block table pin removed externally, re-pinning");
                block_map(ebpf, family)?
                    .pin(&pin)
                    .map_err(|e| KernelError::Write(e.to_string()))?;
            }
            read_entries(ebpf, family).map(Some)
        })
    }

    fn table_insert(&self, interface: &str, entry: &BlockEntry) -> Result<(), KernelError> {
        let pin = self.table_pin(interface, entry.family());
        self.destroyed.lock().clear(interface, entry.family());
        self.with_loaded(interface, |ebpf| {
            if !pin.exists() {
                block_map(ebpf, entry.family())?
                    .pin(&pin)
                    .map_err(|e| KernelError::Write(e.to_string()))?;
            }
            let map = block_map_mut(ebpf, entry.family())?;
            match entry.addr() {
                IpAddr::V4(addr) => {
                    let mut trie: LpmTrie<&mut MapData, [u8; 4], u32> =
                        LpmTrie::try_from(map).map_err(|e| KernelError::Write(e.to_string()))?;
                    trie.insert(&Key::new(entry.prefix_len().into(), addr.octets()), BLOCK_VALUE, 0)
                }
                IpAddr::V6(addr) => {
                    let mut trie: LpmTrie<&mut MapData, [u8; 16], u32> =
                        LpmTrie::try_from(map).map_err(|e| KernelError::Write(e.to_string()))?;
                    trie.insert(&Key::new(entry.prefix_len().into(), addr.octets()), BLOCK_VALUE, 0)
                }
            }
            .map_err(|e| KernelError::Write(e.to_string()))
        })
    }

    fn table_remove(&self, interface: &str, entry: &BlockEntry) -> Result<(), KernelError> {
        let pin = self.table_pin(interface, entry.family());
        if !self.loaded.lock().contains_key(interface) && !pin.exists() {
            return Ok(());
        }
        self.with_loaded(interface, |ebpf| {
            let map = block_map_mut(ebpf, entry.family())?;
            let removed = match entry.addr() {
                IpAddr::V4(addr) => {
                    let mut trie: LpmTrie<&mut MapData, [u8; 4], u32> =
                        LpmTrie::try_from(map).map_err(|e| KernelError::Write(e.to_string()))?;
                    trie.remove(&Key::new(entry.prefix_len().into(), addr.octets()))
                }
                IpAddr::V6(addr) => {
                    let mut trie: LpmTrie<&mut MapData, [u8; 16], u32> =
                        LpmTrie::try_from(map).map_err(|e| KernelError::Write(e.to_string()))?;
                    trie.remove(&Key::new(entry.prefix_len().into(), addr.octets()))
                }
            };
            match removed {
                Ok(()) => Ok(()),
                Err(aya::maps::MapError::KeyNotFound) => Ok(()),
                Err(e) => Err(KernelError::Write(e.to_string())),
            }
        })
    }

    fn table_destroy(&self, interface: &str, family: IpFamily) -> Result<(), KernelError> {
        let pin = self.table_pin(interface, family);
        if self.loaded.lock().contains_key(interface) {
            // The attached program keeps its map reference, so empty it
            // before dropping the pin.
            let entries = self
                .table_entries(interface, family)?
                .unwrap_or_default();
            for entry in &entries {
                self.table_remove(interface, entry)?;
            }
        }
        remove_pin(&pin);
        self.destroyed.lock().mark(interface, family);
        self.release_if_unused(interface);
        Ok(())
    }

    fn managed_interfaces(&self) -> Result<BTreeSet<String>, KernelError> {
        let mut out: BTreeSet<String> = self.loaded.lock().keys().cloned().collect();
        let dir = match fs::read_dir(&self.config.pin_root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(KernelError::Read(e.to_string())),
        };
        for item in dir {
            let item = item.map_err(|e| KernelError::Read(e.to_string()))?;
            if item.path().is_dir() {
                out.insert(item.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(out)
    }
}

fn map_name(family: IpFamily) -> &'static str {
    match family {
        IpFamily::Ipv4 => BLOCK_MAP_V4,
        IpFamily::Ipv6 => BLOCK_MAP_V6,
    }
}

fn xdp_program(ebpf: &mut Ebpf) -> Result<&mut Xdp, KernelError> {
    ebpf.program_mut(PROGRAM_NAME)
        .ok_or_else(|| KernelError::Program(format!("program {PROGRAM_NAME} missing")))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| KernelError::Program(e.to_string()))
}

fn block_map(ebpf: &Ebpf, family: IpFamily) -> Result<&Map, KernelError> {
    let name = map_name(family);
    ebpf.map(name)
        .ok_or_else(|| KernelError::Program(format!("map {name} missing")))
}

fn block_map_mut(ebpf: &mut Ebpf, family: IpFamily) -> Result<&mut Map, KernelError> {
    let name = map_name(family);
    ebpf.map_mut(name)
        .ok_or_else(|| KernelError::Program(format!("map {name} missing")))
}

fn read_entries(ebpf: &Ebpf, family: IpFamily) -> Result<BTreeSet<BlockEntry>, KernelError> {
    let map = block_map(ebpf, family)?;
    let read = |e: aya::maps::MapError| KernelError::Read(e.to_string());
    let to_entry = |addr: IpAddr, prefix_len: u32| {
        u8::try_from(prefix_len)
            .map_err(|_| KernelError::Read(format!("prefix length {prefix_len}")))
            .and_then(|len| {
                BlockEntry::new(addr, len).map_err(|e| KernelError::Read(e.to_string()))
            })
    };

    let mut out = BTreeSet::new();
    match family {
        IpFamily::Ipv4 => {
            let trie: LpmTrie<&MapData, [u8; 4], u32> = LpmTrie::try_from(map).map_err(read)?;
            for key in trie.keys() {
                let key = key.map_err(read)?;
                out.insert(to_entry(IpAddr::from(key.data()), key.prefix_len())?);
            }
        }
        IpFamily::Ipv6 => {
            let trie: LpmTrie<&MapData, [u8; 16], u32> = LpmTrie::try_from(map).map_err(read)?;
            for key in trie.keys() {
                let key = key.map_err(read)?;
                out.insert(to_entry(IpAddr::from(key.data()), key.prefix_len())?);
            }
        }
    }
    Ok(out)
}

fn remove_pin(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove pin"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_family_stays_absent_across_resyncs() {
        let mut destroyed = DestroyedTables::default();
        destroyed.mark("eth0", IpFamily::Ipv4);

        // v6 table and link keep the instance loaded; the v4 pin is gone.
        for _ in 0..2 {
            assert_eq!(destroyed.pin_action("eth0", IpFamily::Ipv4, true, false), PinAction::Absent);
        }
        assert_eq!(destroyed.pin_action("eth0", IpFamily::Ipv6, true, true), PinAction::Read);
    }

    #[test]
    fn insert_after_destroy_owns_the_table_again() {
        let mut destroyed = DestroyedTables::default();
        destroyed.mark("eth0", IpFamily::Ipv4);
        destroyed.clear("eth0", IpFamily::Ipv4);
        assert_eq!(destroyed.pin_action("eth0", IpFamily::Ipv4, true, false), PinAction::Repin);
    }

    #[test]
    fn vanished_pin_is_restored_only_while_loaded() {
        let mut destroyed = DestroyedTables::default();
        assert_eq!(destroyed.pin_action("eth0", IpFamily::Ipv6, true, false), PinAction::Repin);
        assert_eq!(destroyed.pin_action("eth0", IpFamily::Ipv6, false, false), PinAction::Absent);

        destroyed.mark("eth0", IpFamily::Ipv6);
        destroyed.mark("eth1", IpFamily::Ipv6);
        destroyed.forget_interface("eth0");
        assert_eq!(destroyed.pin_action("eth0", IpFamily::Ipv6, true, false), PinAction::Repin);
        assert_eq!(destroyed.pin_action("eth1", IpFamily::Ipv6, true, false), PinAction::Absent);
    }
}
