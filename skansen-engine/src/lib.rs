//! # skansen-engine
//!
//! Keeps kernel state in line with policy.
//!
//! - `sync`: one cycle on one interface (translate, apply, attach/detach)
//! - `enforcer`: per-interface contexts, concurrency, timeouts, telemetry
//! - `scheduler`: the periodic resync and event draining
//! - `source`: policy sources and the change watcher
//! - `runtime`: wiring from configuration

pub mod context;
pub mod enforcer;
pub mod error;
pub mod fallback;
pub mod runtime;
pub mod scheduler;
pub mod source;
pub mod status;
pub mod sync;

pub use context::{InterfaceContext, ResyncState};
pub use enforcer::{Enforcer, SyncOutcome};
pub use error::{EngineError, SyncError};
pub use fallback::{FallbackHandler, LoggingFallback};
pub use runtime::{build_kernel, run_enforcer, shutdown_on_ctrl_c};
pub use scheduler::{ResyncScheduler, TickSummary};
pub use source::{FilePolicySource, PolicySource, PolicyWatcher, SourceError, StaticPolicySource};
pub use status::InterfaceStatus;
pub use sync::{run_cycle, SyncMode, SyncReport};
