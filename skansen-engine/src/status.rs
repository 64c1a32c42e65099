//! Read-only status surface.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use skansen_core::IpFamily;
use skansen_prevention::BindingState;

use crate::error::EngineError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InterfaceStatus {
    pub interface: String,
    pub attached: bool,
    pub program_id: Option<u32>,
    pub program_name: Option<String>,
    pub generation: u64,
    pub binding_state: BindingState,
    pub entries: BTreeMap<IpFamily, usize>,
    pub unsupported: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// A cycle held the interface when this was taken; the rest may be stale.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub busy: bool,
}

impl InterfaceStatus {
    /// Placeholder for an interface whose first cycle is still running.
    pub fn busy(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            attached: false,
            program_id: None,
            program_name: None,
            generation: 0,
            binding_state: BindingState::default(),
            entries: BTreeMap::new(),
            unsupported: false,
            last_attempt: None,
            last_success: None,
            last_error: None,
            busy: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusDocument<'a> {
    generated_at: DateTime<Utc>,
    interfaces: &'a [InterfaceStatus],
}

pub fn render_status(statuses: &[InterfaceStatus]) -> Result<String, EngineError> {
    Ok(serde_yaml::to_string(&StatusDocument {
        generated_at: Utc::now(),
        interfaces: statuses,
    })?)
}

pub async fn write_status(path: &Path, statuses: &[InterfaceStatus]) -> Result<(), EngineError> {
    write_atomic(path, render_status(statuses)?.as_bytes()).await
}

/// Replaces `path` so readers never observe a half-written file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), EngineError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
