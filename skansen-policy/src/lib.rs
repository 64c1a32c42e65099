//! # skansen-policy
//!
//! Turns declarative policy into block entries.
//!
//! - `selector`: label selector expressions (AST, nom parser, evaluation)
//! - `translate`: the prefix translator, producing per-interface desired state
//!   from a policy snapshot

pub mod selector;
pub mod translate;

pub use selector::{parse_selector, Selector, SelectorError};
pub use translate::{PrefixTranslator, SkippedPrefix, TranslateError, Translation};
