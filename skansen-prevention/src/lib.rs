//! # skansen-prevention
//!
//! Kernel-facing half of the enforcer: block tables, the XDP hook lifecycle
//! and the failsafe filter.
//!
//! Everything is written against [`XdpKernel`]. [`MemoryKernel`] models the
//! kernel in process and is what the simulator and tests run against. With
//! the `ebpf_firewall` feature, `AyaKernel` drives real XDP programs and
//! pinned maps.

pub mod error;
pub mod failsafe;
pub mod hook;
pub mod kernel;
pub mod memory;
pub mod table;

#[cfg(feature = "ebpf_firewall")]
pub mod aya_kernel;
#[cfg(feature = "ebpf_firewall")]
mod netlink;

pub use error::{ApplyStage, KernelError, PreventionError};
pub use failsafe::FailsafeFilter;
pub use hook::{BindingState, HookAttacher, HookEvent};
pub use kernel::{ProbeOutcome, ProgramInfo, XdpKernel};
pub use memory::{KernelOp, MemoryKernel, Verdict};
pub use table::{ApplyReport, Baseline, BlockTableManager, TableDrift};

#[cfg(feature = "ebpf_firewall")]
pub use aya_kernel::AyaKernel;
