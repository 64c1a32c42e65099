//! ## skansen-engine::enforcer
//! **Runs sync cycles across interfaces and reports what happened**
//!
//! Each interface has its own context lock. Cycles run on the blocking pool
//! under a timeout; a cycle that finds its interface locked is skipped as
//! `Busy` rather than queued. Interfaces are processed concurrently.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use skansen_core::{DesiredState, PolicyEvent, PolicySnapshot};
use skansen_policy::PrefixTranslator;
use skansen_prevention::{HookEvent, PreventionError, XdpKernel};
use skansen_telemetry::{EventLogger, MetricsRecorder};
use tokio::task::{spawn_blocking, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::context::InterfaceContext;
use crate::error::SyncError;
use crate::fallback::{FallbackHandler, LoggingFallback};
use crate::status::InterfaceStatus;
use crate::sync::{run_cycle, SyncMode, SyncReport};

/// Result of one interface's cycle.
pub type SyncOutcome = (String, Result<SyncReport, SyncError>);

type SharedContext = Arc<Mutex<InterfaceContext>>;

struct CycleOutput {
    result: Result<SyncReport, SyncError>,
    status: Option<InterfaceStatus>,
    newly_unsupported: bool,
}

pub struct Enforcer {
    kernel: Arc<dyn XdpKernel>,
    translator: PrefixTranslator,
    snapshot: RwLock<PolicySnapshot>,
    contexts: RwLock<BTreeMap<String, SharedContext>>,
    statuses: RwLock<BTreeMap<String, InterfaceStatus>>,
    fallback: Arc<dyn FallbackHandler>,
    metrics: Option<Arc<MetricsRecorder>>,
    cycle_timeout: Duration,
}

impl Enforcer {
    pub fn new(kernel: Arc<dyn XdpKernel>, cycle_timeout: Duration) -> Self {
        Self {
            kernel,
            translator: PrefixTranslator::new(),
            snapshot: RwLock::new(PolicySnapshot::new()),
            contexts: RwLock::new(BTreeMap::new()),
            statuses: RwLock::new(BTreeMap::new()),
            fallback: Arc::new(LoggingFallback),
            metrics: None,
            cycle_timeout,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackHandler>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_snapshot(self, snapshot: PolicySnapshot) -> Self {
        *self.snapshot.write() = snapshot;
        self
    }

    pub fn kernel(&self) -> &Arc<dyn XdpKernel> {
        &self.kernel
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        self.snapshot.read().clone()
    }

    pub fn replace_snapshot(&self, snapshot: PolicySnapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Desired state of `interface` under the current snapshot.
    pub fn desired_state(&self, interface: &str) -> Result<DesiredState, SyncError> {
        let snapshot = self.snapshot.read();
        Ok(self.translator.desired_state(&snapshot, interface)?)
    }

    /// Generation of `interface`, if it has ever been cycled and is not
    /// currently locked by a cycle.
    pub fn generation(&self, interface: &str) -> Option<u64> {
        let ctx = self.contexts.read().get(interface).cloned()?;
        let generation = ctx.try_lock().map(|c| c.generation());
        generation.or_else(|| self.statuses.read().get(interface).map(|s| s.generation))
    }

    /// Status of every known interface. Interfaces with a cycle in flight
    /// report their last completed state, marked busy.
    pub fn status(&self) -> Vec<InterfaceStatus> {
        let contexts: Vec<(String, SharedContext)> = self
            .contexts
            .read()
            .iter()
            .map(|(name, ctx)| (name.clone(), Arc::clone(ctx)))
            .collect();
        let cached = self.statuses.read();
        contexts
            .into_iter()
            .map(|(name, ctx)| match ctx.try_lock() {
                Some(c) => c.status(),
                None => match cached.get(&name) {
                    Some(last) => InterfaceStatus {
                        busy: true,
                        ..last.clone()
                    },
                    None => InterfaceStatus::busy(&name),
                },
            })
            .collect()
    }

    fn context(&self, interface: &str) -> SharedContext {
        if let Some(ctx) = self.contexts.read().get(interface) {
            return Arc::clone(ctx);
        }
        Arc::clone(
            self.contexts
                .write()
                .entry(interface.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(InterfaceContext::new(interface)))),
        )
    }

    /// Applies policy changes and runs event-mode cycles on the interfaces
    /// they touch.
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn handle_events(self: &Arc<Self>, events: Vec<PolicyEvent>) -> Vec<SyncOutcome> {
        let affected: BTreeSet<String> = {
            let mut snapshot = self.snapshot.write();
            events
                .into_iter()
                .flat_map(|event| snapshot.apply(event))
                .collect()
        };
        if affected.is_empty() {
            return Vec::new();
        }
        debug!(interfaces = ?affected, "Policy change affects interfaces");
        self.sync_many(affected, SyncMode::Event).await
    }

    /// Unconditional kernel-baseline cycle on every interface with policy
    /// interest: named by a rule, holding state from an earlier cycle, or
    /// carrying pinned state of ours in the kernel.
    #[instrument(skip_all)]
    pub async fn resync_all(self: &Arc<Self>) -> Vec<SyncOutcome> {
        let mut interfaces = self.snapshot.read().interfaces();
        let contexts: Vec<(String, SharedContext)> = self
            .contexts
            .read()
            .iter()
            .map(|(name, ctx)| (name.clone(), Arc::clone(ctx)))
            .collect();
        for (name, ctx) in contexts {
            // A locked context is mid-cycle and therefore interesting.
            let interested = ctx.try_lock().map_or(true, |c| c.has_interest());
            if interested {
                interfaces.insert(name);
            }
        }

        let kernel = Arc::clone(&self.kernel);
        match spawn_blocking(move || kernel.managed_interfaces()).await {
            Ok(Ok(managed)) => interfaces.extend(managed),
            Ok(Err(e)) => warn!(error = %e, "Could not list managed interfaces"),
            Err(e) => warn!(error = %e, "Managed interface listing panicked"),
        }

        self.sync_many(interfaces, SyncMode::Resync).await
    }

    async fn sync_many(
        self: &Arc<Self>,
        interfaces: BTreeSet<String>,
        mode: SyncMode,
    ) -> Vec<SyncOutcome> {
        let mut tasks = JoinSet::new();
        for interface in interfaces {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.sync_interface(&interface, mode).await;
                (interface, result)
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Interface task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// One cycle on one interface: translate, then apply and bind on the
    /// blocking pool within the cycle timeout.
    #[instrument(skip(self), fields(mode = mode.as_str()))]
    pub async fn sync_interface(
        self: &Arc<Self>,
        interface: &str,
        mode: SyncMode,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let ctx = self.context(interface);

        let desired = match self.desired_state(interface) {
            Ok(desired) => desired,
            Err(e) => {
                warn!(interface, error = %e, "Translation failed, skipping cycle");
                if let Some(mut ctx) = ctx.try_lock() {
                    ctx.resync.last_attempt = Some(chrono::Utc::now());
                    ctx.resync.last_error = Some(e.to_string());
                }
                self.record_outcome(interface, mode, &Err(e.clone()), started);
                return Err(e);
            }
        };

        let output = self.run_blocking(interface, ctx, desired.clone(), mode).await;
        if let Some(status) = output.status {
            self.statuses.write().insert(interface.to_string(), status);
        }
        self.record_outcome(interface, mode, &output.result, started);
        match &output.result {
            Ok(report) => self.report_repairs(report).await,
            Err(e) => self.report_failure(interface, &desired, e, output.newly_unsupported).await,
        }
        output.result
    }

    async fn run_blocking(
        &self,
        interface: &str,
        ctx: SharedContext,
        desired: DesiredState,
        mode: SyncMode,
    ) -> CycleOutput {
        let kernel = Arc::clone(&self.kernel);
        let name = interface.to_string();
        let task = spawn_blocking(move || {
            let Some(mut ctx) = ctx.try_lock() else {
                return CycleOutput {
                    result: Err(SyncError::Busy(name)),
                    status: None,
                    newly_unsupported: false,
                };
            };
            let was_unsupported = ctx.hook().is_unsupported();
            let result = run_cycle(&mut ctx, kernel.as_ref(), &desired, mode);
            CycleOutput {
                newly_unsupported: !was_unsupported && ctx.hook().is_unsupported(),
                status: Some(ctx.status()),
                result,
            }
        });

        let result = match timeout(self.cycle_timeout, task).await {
            Ok(Ok(output)) => return output,
            Ok(Err(join)) => SyncError::from(join),
            Err(_) => SyncError::Timeout {
                interface: interface.to_string(),
                after: self.cycle_timeout,
            },
        };
        if let Some(status) = self.statuses.write().get_mut(interface) {
            status.last_error = Some(result.to_string());
        }
        CycleOutput {
            result: Err(result),
            status: None,
            newly_unsupported: false,
        }
    }

    fn record_outcome(
        &self,
        interface: &str,
        mode: SyncMode,
        result: &Result<SyncReport, SyncError>,
        started: Instant,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics.record_cycle(
            interface,
            mode.as_str(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        if let Ok(report) = result {
            metrics.record_writes(interface, "insert", report.apply.inserted);
            metrics.record_writes(interface, "remove", report.apply.removed);
            metrics.record_writes(interface, "destroy", report.apply.destroyed.len());
            metrics.set_generation(interface, report.generation);
        }
    }

    async fn report_repairs(&self, report: &SyncReport) {
        let interface = report.interface.as_str();
        for drift in &report.apply.drift {
            info!(interface, kind = drift.kind(), "Table drift repaired");
            if let Some(metrics) = &self.metrics {
                metrics.record_drift(interface, drift.kind());
            }
            EventLogger::log_event(
                "drift_repaired",
                vec![
                    KeyValue::new("interface", interface.to_string()),
                    KeyValue::new("kind", drift.kind()),
                    KeyValue::new("detail", format!("{drift:?}")),
                ],
            )
            .await;
        }

        for event in report.hook_events.iter().filter(|e| e.is_drift()) {
            if let Some(metrics) = &self.metrics {
                metrics.record_drift(interface, event.kind());
            }
            let (event_type, detail) = match event {
                HookEvent::ForeignReplaced { foreign, current } => (
                    "foreign_program_replaced",
                    format!("{} ({}) -> {}", foreign.name, foreign.id, current.id),
                ),
                HookEvent::Reattached { previous, current } => (
                    "drift_repaired",
                    format!("{:?} -> {}", previous.as_ref().map(|p| p.id), current.id),
                ),
                _ => continue,
            };
            EventLogger::log_event(
                event_type,
                vec![
                    KeyValue::new("interface", interface.to_string()),
                    KeyValue::new("kind", event.kind()),
                    KeyValue::new("detail", detail),
                ],
            )
            .await;
        }
    }

    async fn report_failure(
        &self,
        interface: &str,
        desired: &DesiredState,
        error: &SyncError,
        newly_unsupported: bool,
    ) {
        match error {
            SyncError::Prevention(PreventionError::FeatureUnsupported { reason, .. }) => {
                self.fallback.handle_unsupported(interface, desired, reason);
                if newly_unsupported {
                    EventLogger::log_event(
                        "feature_unsupported",
                        vec![
                            KeyValue::new("interface", interface.to_string()),
                            KeyValue::new("reason", reason.clone()),
                        ],
                    )
                    .await;
                }
            }
            SyncError::Busy(_) => debug!(interface, "Cycle skipped, previous still running"),
            other => warn!(interface, kind = other.kind(), error = %other, "Sync cycle failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skansen_core::{BlockRule, IpFamily, NamedAddressSet};
    use skansen_prevention::MemoryKernel;
    use tracing_test::traced_test;

    fn enforcer(kernel: Arc<MemoryKernel>) -> Arc<Enforcer> {
        Arc::new(Enforcer::new(kernel, Duration::from_secs(2)))
    }

    fn set_event(name: &str, nets: &[&str]) -> PolicyEvent {
        PolicyEvent::AddressSetUpserted(NamedAddressSet {
            name: name.into(),
            labels: [("role".to_string(), "blocked".to_string())].into(),
            nets: nets.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn rule_event(name: &str, interface: &str, selector: &str) -> PolicyEvent {
        PolicyEvent::RuleUpserted(BlockRule {
            name: name.into(),
            interface: interface.into(),
            family: IpFamily::Ipv4,
            source_selector: selector.into(),
        })
    }

    #[tokio::test]
    async fn events_only_touch_affected_interfaces() {
        let kernel = Arc::new(MemoryKernel::default());
        let enforcer = enforcer(kernel.clone());
        let outcomes = enforcer
            .handle_events(vec![
                set_event("a", &["10.0.0.5"]),
                rule_event("r0", "eth0", "role == 'blocked'"),
            ])
            .await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "eth0");
        assert!(outcomes[0].1.is_ok());

        let outcomes = enforcer
            .handle_events(vec![rule_event("r1", "eth1", "role == 'blocked'")])
            .await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "eth1");
        assert_eq!(enforcer.generation("eth0"), Some(1));
    }

    #[tokio::test]
    async fn invalid_selector_changes_nothing() {
        let kernel = Arc::new(MemoryKernel::default());
        let enforcer = enforcer(kernel.clone());
        enforcer
            .handle_events(vec![
                set_event("a", &["10.0.0.5"]),
                rule_event("r0", "eth0", "role == 'blocked'"),
            ])
            .await;
        let before = kernel.table("eth0", IpFamily::Ipv4);

        let outcomes = enforcer
            .handle_events(vec![rule_event("r0", "eth0", "role ==")])
            .await;
        let err = outcomes[0].1.as_ref().unwrap_err();
        assert_eq!(err.kind(), "invalid_selector");
        assert_eq!(kernel.table("eth0", IpFamily::Ipv4), before);
        assert_eq!(enforcer.generation("eth0"), Some(1));

        let status = enforcer.status();
        assert!(status[0].last_error.as_deref().unwrap().contains("invalid selector"));
    }

    #[tokio::test]
    async fn locked_interface_is_reported_busy() {
        let kernel = Arc::new(MemoryKernel::default());
        let enforcer = enforcer(kernel.clone());

        let fresh = enforcer.context("eth1");
        {
            let _held = fresh.lock();
            let status = enforcer.status();
            assert_eq!(status.len(), 1);
            assert_eq!(status[0], InterfaceStatus::busy("eth1"));
        }

        enforcer
            .handle_events(vec![
                set_event("a", &["10.0.0.5"]),
                rule_event("r0", "eth0", "role == 'blocked'"),
            ])
            .await;
        let ctx = enforcer.context("eth0");
        let _held = ctx.lock();
        let eth0 = enforcer
            .status()
            .into_iter()
            .find(|s| s.interface == "eth0")
            .unwrap();
        assert!(eth0.busy);
        assert!(eth0.attached);
        assert_eq!(eth0.generation, 1);
    }

    #[traced_test]
    #[tokio::test]
    async fn translation_failure_is_logged_and_recorded() {
        let mut snapshot = PolicySnapshot::new();
        snapshot.apply(rule_event("r0", "eth0", "role in {"));
        let kernel = Arc::new(MemoryKernel::default());
        let enforcer = enforcer(kernel.clone());
        enforcer.replace_snapshot(snapshot);

        let err = enforcer
            .sync_interface("eth0", SyncMode::Resync)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_selector");
        assert!(logs_contain("Translation failed, skipping cycle"));
        assert!(kernel.ops().is_empty());
    }

    #[tokio::test]
    async fn resync_covers_interfaces_without_rules() {
        let kernel = Arc::new(MemoryKernel::default());
        let enforcer = enforcer(kernel.clone());
        enforcer
            .handle_events(vec![
                set_event("a", &["10.0.0.5"]),
                rule_event("r0", "eth0", "role == 'blocked'"),
            ])
            .await;

        // Rule vanishes without an event reaching the engine.
        let mut snapshot = enforcer.snapshot();
        snapshot.apply(PolicyEvent::RuleRemoved("r0".into()));
        enforcer.replace_snapshot(snapshot);

        let outcomes = enforcer.resync_all().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].1.is_ok());
        assert!(kernel.program("eth0").is_none());
        assert!(!kernel.has_any_table("eth0"));

        // Nothing left to look after.
        assert!(enforcer.resync_all().await.is_empty());
    }

    #[tokio::test]
    async fn leftover_kernel_state_is_reconciled() {
        let kernel = Arc::new(MemoryKernel::default());
        kernel.external_insert_entry("eth3", "10.9.9.9".parse().unwrap());

        let enforcer = enforcer(kernel.clone());
        let outcomes = enforcer.resync_all().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "eth3");
        assert!(!kernel.has_any_table("eth3"));
    }
}
