//! ## skansen-prevention::kernel
//! **The seam between enforcement logic and whatever owns the XDP hook**
//!
//! Every call is synchronous and scoped to one interface. Implementations
//! use interior mutability so one instance can be shared by all interface
//! workers.

use std::collections::BTreeSet;

use serde::Serialize;
use skansen_core::{BlockEntry, IpFamily};

use crate::error::KernelError;

/// Identity of a program attached to an interface.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ProgramInfo {
    pub id: u32,
    pub name: String,
}

impl ProgramInfo {
    pub fn is_ours(&self) -> bool {
        self.name == skansen_common::PROGRAM_NAME
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Supported,
    Unsupported(String),
}

pub trait XdpKernel: Send + Sync {
    /// Checks that an XDP program can be loaded for `interface`. An
    /// `Unsupported` answer is final; errors are transient.
    fn probe(&self, interface: &str) -> Result<ProbeOutcome, KernelError>;

    /// Program currently attached to `interface`, ours or not.
    fn query_program(&self, interface: &str) -> Result<Option<ProgramInfo>, KernelError>;

    /// Attaches our program. Fails if any program is already attached.
    fn attach(&self, interface: &str) -> Result<ProgramInfo, KernelError>;

    /// Detaches `program` from `interface`.
    fn detach(&self, interface: &str, program: &ProgramInfo) -> Result<(), KernelError>;

    /// Contents of the block table, or `None` if it does not exist.
    fn table_entries(
        &self,
        interface: &str,
        family: IpFamily,
    ) -> Result<Option<BTreeSet<BlockEntry>>, KernelError>;

    /// Inserts one entry, creating the table if needed.
    fn table_insert(&self, interface: &str, entry: &BlockEntry) -> Result<(), KernelError>;

    /// Removes one entry. A missing entry or table is not an error.
    fn table_remove(&self, interface: &str, entry: &BlockEntry) -> Result<(), KernelError>;

    /// Deletes the table. A missing table is not an error.
    fn table_destroy(&self, interface: &str, family: IpFamily) -> Result<(), KernelError>;

    /// Interfaces that still carry state of ours (tables or program), so a
    /// fresh process can reconcile them even if no rule names them any more.
    fn managed_interfaces(&self) -> Result<BTreeSet<String>, KernelError>;
}
