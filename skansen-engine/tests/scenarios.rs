use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use skansen_config::ResyncConfig;
use skansen_core::failsafe::default_rules;
use skansen_core::{
    BlockEntry, BlockRule, DesiredState, EventBus, IpFamily, NamedAddressSet, PacketMeta,
    PolicyEvent, PolicySnapshot,
};
use skansen_engine::{
    Enforcer, FallbackHandler, ResyncScheduler, StaticPolicySource, SyncError, SyncMode,
};
use skansen_prevention::{BindingState, FailsafeFilter, MemoryKernel, Verdict, XdpKernel};
use skansen_telemetry::MetricsRecorder;
use tokio::sync::watch;

const IFACE: &str = "eth0";

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn entry(s: &str) -> BlockEntry {
    s.parse().unwrap()
}

fn entries(list: &[&str]) -> BTreeSet<BlockEntry> {
    list.iter().map(|s| entry(s)).collect()
}

fn set(name: &str, nets: &[&str]) -> PolicyEvent {
    PolicyEvent::AddressSetUpserted(NamedAddressSet {
        name: name.into(),
        labels: [("role".to_string(), "blocked".to_string())].into(),
        nets: nets.iter().map(|s| s.to_string()).collect(),
    })
}

fn rule(name: &str, interface: &str, family: IpFamily) -> PolicyEvent {
    PolicyEvent::RuleUpserted(BlockRule {
        name: name.into(),
        interface: interface.into(),
        family,
        source_selector: "role == 'blocked'".into(),
    })
}

fn snapshot(events: Vec<PolicyEvent>) -> PolicySnapshot {
    let mut snapshot = PolicySnapshot::new();
    for event in events {
        snapshot.apply(event);
    }
    snapshot
}

fn kernel() -> Arc<MemoryKernel> {
    Arc::new(MemoryKernel::new(FailsafeFilter::new(default_rules())))
}

fn enforcer(kernel: &Arc<MemoryKernel>) -> Arc<Enforcer> {
    let kernel: Arc<dyn XdpKernel> = kernel.clone();
    Arc::new(Enforcer::new(kernel, Duration::from_secs(2)))
}

/// Program attached iff desired state is non-empty, and tables equal the
/// desired state exactly.
fn assert_converged(kernel: &MemoryKernel, enforcer: &Enforcer, interface: &str) {
    let desired = enforcer.desired_state(interface).unwrap();
    assert_eq!(
        kernel.program(interface).is_some_and(|p| p.is_ours()),
        !desired.is_empty(),
        "attachment does not follow desired state"
    );
    for family in IpFamily::ALL {
        let want = desired.family(family);
        let have = kernel.table(interface, family);
        if want.is_empty() {
            assert!(have.is_none(), "{family} table should not exist");
        } else {
            assert_eq!(have.as_ref(), Some(&want), "{family} table differs");
        }
    }
}

#[tokio::test]
async fn scenario_a_host_entry_blocks_exactly_that_host() {
    let kernel = kernel();
    let enforcer = enforcer(&kernel);
    let outcomes = enforcer
        .handle_events(vec![set("bad", &["10.0.0.5/32"]), rule("r", IFACE, IpFamily::Ipv4)])
        .await;
    assert!(outcomes[0].1.is_ok());

    assert_eq!(kernel.lookup(IFACE, ip("10.0.0.5")), Some(entry("10.0.0.5/32")));
    assert_eq!(kernel.lookup(IFACE, ip("10.0.0.6")), None);

    let blocked = PacketMeta::tcp(ip("10.0.0.5"), ip("10.0.0.1"), 40000, 443);
    let allowed = PacketMeta::tcp(ip("10.0.0.6"), ip("10.0.0.1"), 40000, 443);
    assert_eq!(kernel.evaluate(IFACE, &blocked), Verdict::Drop);
    assert_eq!(kernel.evaluate(IFACE, &allowed), Verdict::Pass);
    assert_converged(&kernel, &enforcer, IFACE);
}

#[tokio::test]
async fn scenario_b_deleted_entry_heals_on_resync() {
    let kernel = kernel();
    let enforcer = enforcer(&kernel);
    enforcer
        .handle_events(vec![set("bad", &["10.0.0.5", "10.0.0.7"]), rule("r", IFACE, IpFamily::Ipv4)])
        .await;

    assert!(kernel.external_delete_entry(IFACE, &entry("10.0.0.5")));
    assert_eq!(kernel.lookup(IFACE, ip("10.0.0.5")), None);

    let outcomes = enforcer.resync_all().await;
    let report = outcomes[0].1.as_ref().unwrap();
    assert_eq!(report.mode, SyncMode::Resync);
    assert_eq!(report.apply.inserted, 1);
    assert_eq!(report.apply.drift.len(), 1);
    assert_eq!(kernel.lookup(IFACE, ip("10.0.0.5")), Some(entry("10.0.0.5")));
    assert_converged(&kernel, &enforcer, IFACE);
}

#[tokio::test]
async fn scenario_c_detached_program_is_reattached() {
    let kernel = kernel();
    let metrics = Arc::new(MetricsRecorder::new().unwrap());
    let enforcer = Arc::new(
        Enforcer::new(kernel.clone(), Duration::from_secs(2)).with_metrics(metrics.clone()),
    );
    enforcer
        .handle_events(vec![set("bad", &["10.0.0.5"]), rule("r", IFACE, IpFamily::Ipv4)])
        .await;
    let old = kernel.external_detach(IFACE).unwrap();
    kernel.external_delete_table(IFACE, IpFamily::Ipv4);

    enforcer.resync_all().await;
    let current = kernel.program(IFACE).unwrap();
    assert!(current.is_ours());
    assert_ne!(current.id, old.id);
    assert_eq!(kernel.lookup(IFACE, ip("10.0.0.5")), Some(entry("10.0.0.5")));
    assert_converged(&kernel, &enforcer, IFACE);

    let status = enforcer.status();
    assert_eq!(status[0].program_id, Some(current.id));
    assert_eq!(status[0].binding_state, BindingState::Attached);

    let text = metrics.gather_metrics().unwrap();
    assert!(text.contains("program_missing"));
    assert!(text.contains("table_missing"));
}

#[tokio::test]
async fn scenario_d_emptied_policy_leaves_nothing_behind() {
    let kernel = kernel();
    let enforcer = enforcer(&kernel);
    enforcer
        .handle_events(vec![
            set("bad", &["10.0.0.5", "fd00::1"]),
            rule("r4", IFACE, IpFamily::Ipv4),
            rule("r6", IFACE, IpFamily::Ipv6),
        ])
        .await;
    assert!(kernel.table(IFACE, IpFamily::Ipv6).is_some());

    let outcomes = enforcer
        .handle_events(vec![
            PolicyEvent::RuleRemoved("r4".into()),
            PolicyEvent::RuleRemoved("r6".into()),
        ])
        .await;
    let report = outcomes[0].1.as_ref().unwrap();
    assert_eq!(report.apply.destroyed, vec![IpFamily::Ipv4, IpFamily::Ipv6]);
    assert!(kernel.program(IFACE).is_none());
    assert!(!kernel.has_any_table(IFACE));
    assert_eq!(enforcer.status()[0].binding_state, BindingState::NoProgram);
    assert_converged(&kernel, &enforcer, IFACE);
}

#[tokio::test]
async fn scenario_e_failed_write_keeps_last_known_good() {
    let kernel = kernel();
    let enforcer = enforcer(&kernel);
    enforcer
        .handle_events(vec![set("bad", &["10.0.0.1", "10.0.0.2"]), rule("r", IFACE, IpFamily::Ipv4)])
        .await;
    assert_eq!(enforcer.generation(IFACE), Some(1));

    kernel.fail_write_after(1);
    let outcomes = enforcer
        .handle_events(vec![set("bad", &["10.0.0.3", "10.0.0.4"])])
        .await;
    let err = outcomes[0].1.as_ref().unwrap_err();
    assert_eq!(err.kind(), "apply_failed");
    assert_eq!(enforcer.generation(IFACE), Some(1));

    let status = &enforcer.status()[0];
    assert_eq!(status.entries.get(&IpFamily::Ipv4), Some(&2));
    assert!(status.last_error.is_some());
    // Adds go first, so the failure left extra denies and removed nothing.
    assert_eq!(
        kernel.table(IFACE, IpFamily::Ipv4),
        Some(entries(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]))
    );

    let outcomes = enforcer.resync_all().await;
    assert!(outcomes[0].1.is_ok());
    assert_eq!(enforcer.generation(IFACE), Some(2));
    assert_eq!(
        kernel.table(IFACE, IpFamily::Ipv4),
        Some(entries(&["10.0.0.3", "10.0.0.4"]))
    );
    assert!(enforcer.status()[0].last_error.is_none());
}

#[tokio::test]
async fn failsafe_traffic_survives_default_route_block() {
    let kernel = kernel();
    let enforcer = enforcer(&kernel);
    enforcer
        .handle_events(vec![set("everything", &["0.0.0.0/0"]), rule("r", IFACE, IpFamily::Ipv4)])
        .await;

    let src = ip("203.0.113.9");
    let dst = ip("192.0.2.1");
    // Inbound ssh, outbound DNS reply, BGP either way.
    assert_eq!(kernel.evaluate(IFACE, &PacketMeta::tcp(src, dst, 51000, 22)), Verdict::Pass);
    assert_eq!(kernel.evaluate(IFACE, &PacketMeta::udp(src, dst, 53, 34000)), Verdict::Pass);
    assert_eq!(kernel.evaluate(IFACE, &PacketMeta::tcp(src, dst, 179, 40000)), Verdict::Pass);
    assert_eq!(kernel.evaluate(IFACE, &PacketMeta::tcp(src, dst, 51000, 443)), Verdict::Drop);
    assert_eq!(kernel.evaluate(IFACE, &PacketMeta::icmp(src, dst)), Verdict::Drop);
}

#[tokio::test]
async fn foreign_program_is_replaced() {
    let kernel = kernel();
    let metrics = Arc::new(MetricsRecorder::new().unwrap());
    let enforcer = Arc::new(
        Enforcer::new(kernel.clone(), Duration::from_secs(2)).with_metrics(metrics.clone()),
    );
    let foreign = kernel.attach_foreign(IFACE, "other_xdp");

    enforcer
        .handle_events(vec![set("bad", &["10.0.0.5"]), rule("r", IFACE, IpFamily::Ipv4)])
        .await;
    let current = kernel.program(IFACE).unwrap();
    assert!(current.is_ours());
    assert_ne!(current.id, foreign.id);
    assert!(metrics.gather_metrics().unwrap().contains("foreign_program"));

    // Interfaces without policy interest are never touched.
    let other = kernel.attach_foreign("eth1", "other_xdp");
    enforcer.resync_all().await;
    assert_eq!(kernel.program("eth1"), Some(other));
}

#[derive(Default)]
struct RecordingFallback {
    calls: Mutex<Vec<(String, usize)>>,
}

impl FallbackHandler for RecordingFallback {
    fn handle_unsupported(&self, interface: &str, desired: &DesiredState, _reason: &str) {
        self.calls.lock().push((interface.to_string(), desired.len()));
    }
}

#[tokio::test]
async fn unsupported_interface_goes_to_fallback_every_cycle() {
    let kernel = kernel();
    kernel.mark_unsupported(IFACE, "driver lacks XDP");
    let fallback = Arc::new(RecordingFallback::default());
    let enforcer = Arc::new(
        Enforcer::new(kernel.clone(), Duration::from_secs(2)).with_fallback(fallback.clone()),
    );

    let outcomes = enforcer
        .handle_events(vec![set("bad", &["10.0.0.5"]), rule("r", IFACE, IpFamily::Ipv4)])
        .await;
    assert!(outcomes[0].1.as_ref().unwrap_err().is_unsupported());
    kernel.clear_ops();

    for _ in 0..3 {
        let outcomes = enforcer.resync_all().await;
        assert_eq!(outcomes[0].1.as_ref().unwrap_err().kind(), "feature_unsupported");
    }
    assert!(kernel.ops().is_empty(), "unsupported interface touched the kernel");
    assert_eq!(fallback.calls.lock().len(), 4);
    assert_eq!(fallback.calls.lock()[0], (IFACE.to_string(), 1));

    let status = &enforcer.status()[0];
    assert!(status.unsupported);
    assert_eq!(status.binding_state, BindingState::Unsupported);
    assert_eq!(status.generation, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_cycle_times_out_and_blocks_the_next_one() {
    let kernel = kernel();
    let enforcer = Arc::new(Enforcer::new(kernel.clone(), Duration::from_millis(100)));
    enforcer.replace_snapshot(snapshot(vec![
        set("bad", &["10.0.0.5"]),
        rule("r", IFACE, IpFamily::Ipv4),
    ]));

    kernel.set_call_delay(Some(Duration::from_millis(150)));
    let first = enforcer.sync_interface(IFACE, SyncMode::Resync).await;
    assert!(matches!(first, Err(SyncError::Timeout { .. })));

    let second = enforcer.sync_interface(IFACE, SyncMode::Resync).await;
    assert!(matches!(second, Err(SyncError::Busy(_))));

    kernel.set_call_delay(None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let third = enforcer.sync_interface(IFACE, SyncMode::Resync).await;
    assert!(third.is_ok());
    assert_converged(&kernel, &enforcer, IFACE);
}

#[tokio::test(start_paused = true)]
async fn scheduler_heals_drift_within_one_period() {
    let kernel = kernel();
    let enforcer = enforcer(&kernel);
    let source = Arc::new(StaticPolicySource::new(snapshot(vec![
        set("bad", &["10.0.0.5", "fd00::/64"]),
        rule("r4", IFACE, IpFamily::Ipv4),
        rule("r6", IFACE, IpFamily::Ipv6),
    ])));
    let config = ResyncConfig::default();
    let period = config.period();
    let scheduler = ResyncScheduler::new(
        enforcer.clone(),
        source.clone(),
        Arc::new(EventBus::with_capacity(64)),
        config,
    );

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(scheduler.run(rx));

    // First tick fires immediately.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_converged(&kernel, &enforcer, IFACE);

    kernel.external_delete_entry(IFACE, &entry("10.0.0.5"));
    kernel.external_detach(IFACE);
    tokio::time::sleep(period + Duration::from_secs(1)).await;
    assert_converged(&kernel, &enforcer, IFACE);
    assert!(enforcer.generation(IFACE).unwrap() >= 2);

    // Policy shrinks without any event reaching the bus.
    source.update(PolicyEvent::RuleRemoved("r6".into()));
    tokio::time::sleep(period + Duration::from_secs(1)).await;
    assert!(kernel.table(IFACE, IpFamily::Ipv6).is_none());
    assert_converged(&kernel, &enforcer, IFACE);

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn queued_events_apply_before_the_next_tick() {
    let kernel = kernel();
    let enforcer = enforcer(&kernel);
    let source = Arc::new(StaticPolicySource::default());
    let bus = Arc::new(EventBus::with_capacity(64));
    let scheduler = ResyncScheduler::new(
        enforcer.clone(),
        source.clone(),
        bus.clone(),
        ResyncConfig::default(),
    );

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(scheduler.run(rx));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(kernel.program(IFACE).is_none());

    for event in [set("bad", &["10.0.0.5"]), rule("r", IFACE, IpFamily::Ipv4)] {
        source.update(event.clone());
        bus.event_enqueue(event).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(kernel.program(IFACE).is_some());
    assert_converged(&kernel, &enforcer, IFACE);

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}
