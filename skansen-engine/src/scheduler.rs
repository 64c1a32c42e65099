//! ## skansen-engine::scheduler
//! **Resync Scheduler: the periodic unconditional sync**
//!
//! Every `resync.period` the scheduler refreshes the policy snapshot and
//! runs a kernel-baseline cycle on every interface of interest, whether or
//! not anything changed. Between ticks it drains the event bus every
//! `resync.event_poll` and runs event-mode cycles for what changed. Missed
//! ticks are delayed, never bunched.

use std::path::PathBuf;
use std::sync::Arc;

use skansen_config::ResyncConfig;
use skansen_core::EventBus;
use skansen_telemetry::MetricsRecorder;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::enforcer::{Enforcer, SyncOutcome};
use crate::error::EngineError;
use crate::source::PolicySource;
use crate::status::{write_atomic, write_status};

/// Aggregate of one tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_busy: usize,
}

impl TickSummary {
    fn from_outcomes(outcomes: &[SyncOutcome]) -> Self {
        let mut summary = Self::default();
        for (_, result) in outcomes {
            match result {
                Ok(_) => summary.succeeded += 1,
                Err(crate::error::SyncError::Busy(_)) => summary.skipped_busy += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

pub struct ResyncScheduler {
    enforcer: Arc<Enforcer>,
    source: Arc<dyn PolicySource>,
    bus: Arc<EventBus>,
    config: ResyncConfig,
    metrics: Option<Arc<MetricsRecorder>>,
    status_path: Option<PathBuf>,
    metrics_path: Option<PathBuf>,
}

impl ResyncScheduler {
    pub fn new(
        enforcer: Arc<Enforcer>,
        source: Arc<dyn PolicySource>,
        bus: Arc<EventBus>,
        config: ResyncConfig,
    ) -> Self {
        Self {
            enforcer,
            source,
            bus,
            config,
            metrics: None,
            status_path: None,
            metrics_path: None,
        }
    }

    pub fn with_status_path(mut self, path: Option<PathBuf>) -> Self {
        self.status_path = path;
        self
    }

    /// Metrics exposition is written to `path` after every tick.
    pub fn with_metrics_output(
        mut self,
        metrics: Arc<MetricsRecorder>,
        path: Option<PathBuf>,
    ) -> Self {
        self.metrics = Some(metrics);
        self.metrics_path = path;
        self
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    /// Refreshes the snapshot and resyncs every interface of interest.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickSummary {
        match self.source.snapshot().await {
            Ok(snapshot) => self.enforcer.replace_snapshot(snapshot),
            Err(e) => warn!(error = %e, "Policy refresh failed, resyncing last snapshot"),
        }

        let outcomes = self.enforcer.resync_all().await;
        let summary = TickSummary::from_outcomes(&outcomes);
        debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            busy = summary.skipped_busy,
            "Resync tick complete"
        );

        if let Err(e) = self.write_outputs().await {
            warn!(error = %e, "Failed to write status outputs");
        }
        summary
    }

    /// Runs event-mode cycles for everything queued since the last drain.
    pub async fn drain_events(&self) -> Vec<SyncOutcome> {
        let events = self.bus.event_drain();
        if events.is_empty() {
            return Vec::new();
        }
        debug!(count = events.len(), "Draining policy events");
        self.enforcer.handle_events(events).await
    }

    async fn write_outputs(&self) -> Result<(), EngineError> {
        if let Some(path) = &self.status_path {
            write_status(path, &self.enforcer.status()).await?;
        }
        if let (Some(metrics), Some(path)) = (&self.metrics, &self.metrics_path) {
            write_atomic(path, metrics.gather_metrics()?.as_bytes()).await?;
        }
        Ok(())
    }

    /// Ticks until `shutdown` flips to true or its sender goes away. A cycle
    /// in flight at that point is abandoned; kernel state persists and is
    /// reconciled on the next start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(
            period = ?self.config.period(),
            timeout = ?self.config.cycle_timeout(),
            "Resync scheduler started"
        );
        let mut ticker = interval(self.config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = interval(self.config.event_poll());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = poll.tick() => {
                    self.drain_events().await;
                }
            }
        }
        info!("Resync scheduler stopped");
        Ok(())
    }
}
