/*!
# Runtime

Wires configuration into a running enforcer: kernel backend, policy source
and watcher, event bus, scheduler, and shutdown. Frontends call
[`run_enforcer`] and own nothing else.
*/

use std::sync::Arc;

use skansen_config::{KernelBackend, SkansenConfig};
use skansen_core::EventBus;
use skansen_prevention::{FailsafeFilter, MemoryKernel, XdpKernel};
use skansen_telemetry::MetricsRecorder;
use tokio::sync::watch;
use tracing::{info, instrument, warn, Instrument};

use crate::enforcer::Enforcer;
use crate::error::EngineError;
use crate::scheduler::ResyncScheduler;
use crate::source::{FilePolicySource, PolicySource, PolicyWatcher};

/// Kernel backend selected by `kernel.backend`.
pub fn build_kernel(config: &SkansenConfig) -> Result<Arc<dyn XdpKernel>, EngineError> {
    let failsafe = FailsafeFilter::new(config.failsafe.rules());
    info!(
        backend = ?config.kernel.backend,
        failsafe_rules = failsafe.len(),
        "Selecting kernel backend"
    );
    match config.kernel.backend {
        KernelBackend::Memory => Ok(Arc::new(MemoryKernel::new(failsafe))),
        #[cfg(feature = "ebpf_firewall")]
        KernelBackend::Aya => Ok(Arc::new(skansen_prevention::AyaKernel::new(
            config.kernel.clone(),
            failsafe,
        ))),
        #[cfg(not(feature = "ebpf_firewall"))]
        KernelBackend::Aya => Err(EngineError::Backend(
            "built without the ebpf_firewall feature; set kernel.backend = memory".into(),
        )),
    }
}

/// Runs the enforcer until `shutdown` flips to true.
#[instrument(level = "info", name = "run_enforcer", skip_all)]
pub async fn run_enforcer(
    config: SkansenConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let kernel = build_kernel(&config)?;
    let metrics = Arc::new(MetricsRecorder::new()?);
    let source: Arc<dyn PolicySource> = Arc::new(FilePolicySource::new(&config.policy.path));

    let initial = source.snapshot().await?;
    info!(
        path = %config.policy.path.display(),
        rules = initial.rules().count(),
        sets = initial.address_sets().count(),
        "Policy loaded"
    );

    let enforcer = Arc::new(
        Enforcer::new(kernel, config.resync.cycle_timeout())
            .with_metrics(Arc::clone(&metrics))
            .with_snapshot(initial.clone()),
    );
    let bus = Arc::new(EventBus::with_capacity(config.resync.event_capacity));

    let watcher = PolicyWatcher::new(Arc::clone(&source), Arc::clone(&bus), initial);
    let watcher_task = tokio::spawn(
        watcher
            .run(config.policy.watch_interval(), shutdown.clone())
            .instrument(tracing::info_span!("policy_watcher_task")),
    );

    let scheduler = ResyncScheduler::new(enforcer, source, bus, config.resync.clone())
        .with_status_path(config.telemetry.status_path.clone())
        .with_metrics_output(metrics, config.telemetry.metrics_path.clone());
    let result = scheduler
        .run(shutdown)
        .instrument(tracing::info_span!("resync_scheduler_task"))
        .await;

    if let Err(e) = watcher_task.await {
        warn!(error = %e, "Policy watcher ended abnormally");
    }
    result
}

/// Shutdown channel flipped by Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Ctrl-C handler failed, shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}
