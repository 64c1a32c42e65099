//! ## skansen-engine::source
//! **Policy input: snapshot providers and the change watcher**
//!
//! The resync tick pulls a full snapshot from a [`PolicySource`]. Between
//! ticks, [`PolicyWatcher`] polls the same source, diffs consecutive
//! snapshots and queues the differences as [`PolicyEvent`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use skansen_config::validation::validate_interface;
use skansen_core::{EventBus, PolicyDocument, PolicyEvent, PolicySnapshot};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Rule '{rule}' names an invalid interface '{interface}'")]
    InvalidInterface { rule: String, interface: String },
}

#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Current policy in full.
    async fn snapshot(&self) -> Result<PolicySnapshot, SourceError>;
}

/// Rejects documents whose rules name something that cannot be a Linux
/// interface.
pub fn validate_document(document: &PolicyDocument) -> Result<(), SourceError> {
    for rule in &document.rules {
        if validate_interface(&rule.interface).is_err() {
            return Err(SourceError::InvalidInterface {
                rule: rule.name.clone(),
                interface: rule.interface.clone(),
            });
        }
    }
    Ok(())
}

pub fn parse_document(text: &str) -> Result<PolicySnapshot, SourceError> {
    let document: PolicyDocument = serde_yaml::from_str(text)?;
    validate_document(&document)?;
    Ok(PolicySnapshot::from(document))
}

/// YAML policy document on disk, re-read on every call.
#[derive(Clone, Debug)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn snapshot(&self) -> Result<PolicySnapshot, SourceError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_document(&text)
    }
}

/// In-memory source, replaced wholesale by its owner.
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    snapshot: RwLock<PolicySnapshot>,
}

impl StaticPolicySource {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: PolicySnapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Applies one change in place.
    pub fn update(&self, event: PolicyEvent) {
        self.snapshot.write().apply(event);
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn snapshot(&self) -> Result<PolicySnapshot, SourceError> {
        Ok(self.snapshot.read().clone())
    }
}

/// Turns snapshot changes into queued events.
pub struct PolicyWatcher {
    source: Arc<dyn PolicySource>,
    bus: Arc<EventBus>,
    last: PolicySnapshot,
}

impl PolicyWatcher {
    /// `initial` is the snapshot the engine already knows about.
    pub fn new(source: Arc<dyn PolicySource>, bus: Arc<EventBus>, initial: PolicySnapshot) -> Self {
        Self {
            source,
            bus,
            last: initial,
        }
    }

    /// Polls the source once and queues every difference. Returns the number
    /// of events queued.
    pub async fn poll_once(&mut self) -> Result<usize, SourceError> {
        let next = self.source.snapshot().await?;
        let events = self.last.diff(&next);
        if events.is_empty() {
            return Ok(0);
        }

        let mut queued = 0;
        for event in events {
            let kind = event.kind();
            if let Err(e) = self.bus.event_enqueue(event) {
                // The next resync tick picks the change up from the snapshot.
                warn!(kind, error = %e, "Dropping policy event");
                continue;
            }
            queued += 1;
        }
        debug!(queued, "Policy change detected");
        self.last = next;
        Ok(queued)
    }

    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?period, "Policy watcher started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Policy source unavailable, keeping last snapshot");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Policy watcher stopped");
    }
}
