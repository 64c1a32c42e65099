//! # skansen-core
//!
//! Foundation layer shared by every skansen crate: block entries and their
//! kernel key encoding, per-interface desired state, failsafe rule and packet
//! types, the declarative policy model, and the policy event bus.
//!
//! ### Key Submodules:
//! - `entry`: normalized prefixes (`BlockEntry`) and LPM key encoding
//! - `desired`: per-family desired state and table diffs
//! - `policy`: named address sets, block rules, snapshots and their diffs
//! - `events`: bounded queue carrying `PolicyEvent`s to the engine

pub mod desired;
pub mod entry;
pub mod error;
pub mod events;
pub mod failsafe;
pub mod family;
pub mod packet;
pub mod policy;

pub mod prelude {
    pub use crate::desired::*;
    pub use crate::entry::*;
    pub use crate::error::*;
    pub use crate::events::*;
    pub use crate::failsafe::*;
    pub use crate::family::*;
    pub use crate::packet::*;
    pub use crate::policy::*;
}

pub use desired::{DesiredState, TableDiff};
pub use entry::BlockEntry;
pub use error::CoreError;
pub use events::{EventBus, EventError};
pub use failsafe::{Direction, FailsafeRule, ProtoPort, Protocol};
pub use family::IpFamily;
pub use packet::{PacketMeta, Transport};
pub use policy::{BlockRule, NamedAddressSet, PolicyDocument, PolicyEvent, PolicySnapshot};
