//! Scheduler module for running probes on two independent cadences.
//!
//! The comprehensive cadence runs a Ping, PortCheck, Throughput, Traceroute
//! chain per target (targets in parallel), then the local-only probes. The
//! continuous cadence fires a single-shot ping at every target. Every finished
//! probe is sent to the recorder over a channel.

mod local;

pub use local::*;

use crate::alert::evaluate;
use crate::clock::Clock;
use crate::config::RunConfig;
use crate::probe::{
    run_port_checks, run_probe, Cadence, ProbeKind, ProbeRequest, ProbeRunner, Target,
};
use crate::results::{RecordTx, Recorded};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};

/// Source name used when the local address cannot be resolved.
const LOCALHOST: &str = "localhost";

/// One in-flight comprehensive chain per target.
type ChainGuards = HashMap<String, Arc<Semaphore>>;

struct Context {
    config: Arc<RunConfig>,
    runner: Arc<dyn ProbeRunner>,
    resolver: Arc<dyn SelfAddress>,
    clock: Clock,
    record_tx: RecordTx,
    stop_rx: watch::Receiver<bool>,
}

impl Context {
    /// True once stop was requested or the handle was dropped.
    fn stopped(&self) -> bool {
        *self.stop_rx.borrow() || self.stop_rx.has_changed().is_err()
    }

    /// Run one probe and hand the outcome to the recorder.
    ///
    /// Returns `None` without dispatching once a stop was requested.
    async fn dispatch(
        &self,
        kind: ProbeKind,
        cadence: Cadence,
        target: &Target,
        source: &str,
    ) -> Option<bool> {
        if self.stopped() {
            return None;
        }

        let request = ProbeRequest::new(kind, cadence, target.clone(), source, self.clock.now());
        let runner = self.runner.as_ref();
        let result = match kind {
            ProbeKind::PortCheck => run_port_checks(runner, request, &self.clock).await,
            _ => run_probe(runner, request, &self.clock).await,
        };
        let alerts = evaluate(&result, &self.config.thresholds);
        let success = result.success;

        if self.record_tx.send(Recorded { result, alerts }).await.is_err() {
            tracing::error!("Scheduler: recorder stopped, dropping {} result for {}", kind, target.address);
        }
        Some(success)
    }
}

/// Drives the comprehensive and continuous cadences.
pub struct Scheduler {
    config: Arc<RunConfig>,
    runner: Arc<dyn ProbeRunner>,
    resolver: Arc<dyn SelfAddress>,
    clock: Clock,
}

impl Scheduler {
    pub fn new(
        config: Arc<RunConfig>,
        runner: Arc<dyn ProbeRunner>,
        resolver: Arc<dyn SelfAddress>,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            runner,
            resolver,
            clock,
        }
    }

    /// Start both cadences. Results are sent to `record_tx` until stopped.
    pub fn start(&self, record_tx: RecordTx) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = Arc::new(Context {
            config: self.config.clone(),
            runner: self.runner.clone(),
            resolver: self.resolver.clone(),
            clock: self.clock,
            record_tx,
            stop_rx,
        });

        let guards: Arc<ChainGuards> = Arc::new(
            self.config
                .targets
                .iter()
                .map(|t| (t.address.clone(), Arc::new(Semaphore::new(1))))
                .collect(),
        );

        tracing::info!(
            "Starting scheduler with {} targets, cycle every {:?}, ping every {:?}",
            self.config.targets.len(),
            self.config.interval,
            self.config.ping_interval
        );

        let tasks = vec![
            tokio::spawn(run_comprehensive(ctx.clone(), guards)),
            tokio::spawn(run_continuous(ctx)),
        ];

        SchedulerHandle { stop_tx, tasks }
    }
}

/// Controls a running scheduler.
///
/// Dropping it stops dispatching like [`SchedulerHandle::stop`], without
/// waiting for in-flight probes.
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Request cooperative cancellation. No probe is dispatched after this
    /// returns; probes already running finish or time out on their own.
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            tracing::info!("Scheduler: stop requested");
        }
    }

    /// Wait for both cadences and every in-flight probe to finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Scheduler: cadence task failed: {}", e);
            }
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            tracing::error!("Scheduler: probe task failed: {}", e);
        }
    }
}

async fn run_comprehensive(ctx: Arc<Context>, guards: Arc<ChainGuards>) {
    let mut stop_rx = ctx.stop_rx.clone();
    let mut interval = time::interval(ctx.config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cycles = JoinSet::new();
    let mut cycle = 0u64;

    while !ctx.stopped() {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            Some(done) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(e) = done {
                    tracing::error!("Scheduler: comprehensive cycle failed: {}", e);
                }
            }
            _ = interval.tick() => {
                cycle += 1;
                cycles.spawn(run_cycle(ctx.clone(), guards.clone(), cycle));
            }
        }
    }

    drain(&mut cycles).await;
    tracing::info!("Scheduler: comprehensive cadence stopped after {} cycles", cycle);
}

async fn run_cycle(ctx: Arc<Context>, guards: Arc<ChainGuards>, cycle: u64) {
    if ctx.stopped() {
        return;
    }

    let local = ctx.resolver.resolve();
    let source = local.clone().unwrap_or_else(|| LOCALHOST.to_string());
    tracing::info!("Comprehensive cycle {} started from {}", cycle, source);

    let mut chains = JoinSet::new();
    for target in &ctx.config.targets {
        if is_self(target, local.as_deref()) {
            tracing::debug!("Cycle {}: skipping self address {}", cycle, target.address);
            continue;
        }

        let permit = match guards.get(&target.address).map(|g| g.clone().try_acquire_owned()) {
            Some(Ok(permit)) => permit,
            _ => {
                tracing::warn!(
                    "Cycle {}: skipping {}, previous chain still in flight",
                    cycle,
                    target.address
                );
                continue;
            }
        };

        chains.spawn(run_target_chain(ctx.clone(), target.clone(), source.clone(), permit));
    }
    drain(&mut chains).await;

    run_local_probes(&ctx, &source).await;
    tracing::info!("Comprehensive cycle {} finished", cycle);
}

/// Ping, port checks, throughput and traceroute against one target, in order.
async fn run_target_chain(
    ctx: Arc<Context>,
    target: Target,
    source: String,
    _permit: OwnedSemaphorePermit,
) {
    // Spread chain starts so targets are not hit in lockstep
    let jitter = rand::random::<u64>() % 100;
    time::sleep(Duration::from_millis(jitter)).await;

    for kind in [
        ProbeKind::Ping,
        ProbeKind::PortCheck,
        ProbeKind::Throughput,
        ProbeKind::Traceroute,
    ] {
        if kind == ProbeKind::PortCheck && target.ports.is_empty() {
            continue;
        }
        match ctx
            .dispatch(kind, Cadence::Comprehensive, &target, &source)
            .await
        {
            None => return,
            Some(false) if kind == ProbeKind::PortCheck => {
                tracing::warn!("Port check on {} failed, remaining ports skipped", target.address);
            }
            Some(_) => {}
        }
    }
}

async fn run_local_probes(ctx: &Context, source: &str) {
    let local = Target::new(source, ctx.config.ports.clone());
    for kind in ProbeKind::all().into_iter().filter(|k| k.is_local()) {
        if ctx
            .dispatch(kind, Cadence::Comprehensive, &local, source)
            .await
            .is_none()
        {
            return;
        }
    }
}

async fn run_continuous(ctx: Arc<Context>) {
    let mut stop_rx = ctx.stop_rx.clone();
    let mut interval = time::interval(ctx.config.ping_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut pings = JoinSet::new();
    let mut rounds = 0u64;

    while !ctx.stopped() {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            Some(done) = pings.join_next(), if !pings.is_empty() => {
                if let Err(e) = done {
                    tracing::error!("Scheduler: continuous ping failed: {}", e);
                }
            }
            _ = interval.tick() => {
                rounds += 1;
                let local = ctx.resolver.resolve();
                let source = local.clone().unwrap_or_else(|| LOCALHOST.to_string());
                for target in &ctx.config.targets {
                    if is_self(target, local.as_deref()) {
                        continue;
                    }
                    let ctx = ctx.clone();
                    let target = target.clone();
                    let source = source.clone();
                    pings.spawn(async move {
                        ctx.dispatch(ProbeKind::Ping, Cadence::Continuous, &target, &source)
                            .await;
                    });
                }
            }
        }
    }

    drain(&mut pings).await;
    tracing::info!("Scheduler: continuous cadence stopped after {} rounds", rounds);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertKind;
    use crate::probe::{PortStatus, ProbeError};
    use crate::results::{record_channel, RecordRx};
    use crate::testing::FakeRunner;

    const LOCAL_KINDS: [ProbeKind; 3] = [
        ProbeKind::SocketStats,
        ProbeKind::TcpMetrics,
        ProbeKind::PacketCapture,
    ];

    const CHAIN_KINDS: [ProbeKind; 4] = [
        ProbeKind::Ping,
        ProbeKind::PortCheck,
        ProbeKind::Throughput,
        ProbeKind::Traceroute,
    ];

    fn config(targets: &[&str], ports: &[u16]) -> RunConfig {
        RunConfig {
            targets: targets.iter().map(|t| Target::new(*t, ports.to_vec())).collect(),
            ports: ports.to_vec(),
            interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(1),
            ..RunConfig::default()
        }
    }

    fn start(config: RunConfig, runner: Arc<FakeRunner>) -> (SchedulerHandle, RecordRx) {
        let scheduler = Scheduler::new(
            Arc::new(config),
            runner,
            Arc::new(StaticAddress("10.0.0.1".into())),
            Clock::new(),
        );
        let (tx, rx) = record_channel();
        (scheduler.start(tx), rx)
    }

    async fn finish(handle: SchedulerHandle) {
        handle.stop();
        handle.join().await;
    }

    async fn collect(mut rx: RecordRx) -> Vec<Recorded> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    fn comprehensive<'a>(records: &'a [Recorded], addr: &'a str) -> impl Iterator<Item = &'a Recorded> {
        records
            .iter()
            .filter(|r| r.result.request.cadence == Cadence::Comprehensive)
            .filter(move |r| r.result.request.target.address == addr)
    }

    fn comprehensive_kinds(records: &[Recorded], addr: &str) -> Vec<ProbeKind> {
        comprehensive(records, addr).map(|r| r.result.request.kind).collect()
    }

    fn alert_kinds(record: &Recorded) -> Vec<AlertKind> {
        record.alerts.iter().map(|a| a.kind).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_cycle_order_and_local_kinds() {
        let runner = Arc::new(FakeRunner::healthy());
        let (handle, rx) = start(config(&["10.0.0.2", "10.0.0.3"], &[8080, 9090]), runner.clone());

        time::sleep(Duration::from_millis(500)).await;
        finish(handle).await;
        let records = collect(rx).await;

        assert_eq!(comprehensive_kinds(&records, "10.0.0.2"), CHAIN_KINDS.to_vec());
        assert_eq!(comprehensive_kinds(&records, "10.0.0.3"), CHAIN_KINDS.to_vec());
        assert_eq!(comprehensive_kinds(&records, "10.0.0.1"), LOCAL_KINDS.to_vec());

        // Both ports are folded into one port check result
        let ports = comprehensive(&records, "10.0.0.2")
            .find(|r| r.result.request.kind == ProbeKind::PortCheck)
            .unwrap();
        assert_eq!(ports.result.request.port, None);
        assert_eq!(
            ports.result.ports,
            vec![
                PortStatus { port: 8080, connected: true },
                PortStatus { port: 9090, connected: true },
            ]
        );
        assert_eq!(runner.count(ProbeKind::PortCheck), 4);

        // Local probes come after every target chain
        let first_local = records
            .iter()
            .position(|r| r.result.request.kind.is_local())
            .unwrap();
        let last_remote = records
            .iter()
            .rposition(|r| {
                r.result.request.cadence == Cadence::Comprehensive && !r.result.request.kind.is_local()
            })
            .unwrap();
        assert!(last_remote < first_local);
        assert!(records.iter().all(|r| r.result.success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_target_does_not_block_others() {
        let runner = Arc::new(
            FakeRunner::healthy().stall("10.0.0.2", ProbeKind::Throughput, Duration::from_secs(30)),
        );
        let (handle, rx) = start(config(&["10.0.0.2", "10.0.0.3"], &[8080]), runner.clone());

        time::sleep(Duration::from_secs(3)).await;

        let slow = runner.calls_to("10.0.0.2");
        let fast = runner.calls_to("10.0.0.3");
        assert!(slow.iter().any(|c| c.kind == ProbeKind::Throughput));
        assert!(!slow.iter().any(|c| c.kind == ProbeKind::Traceroute));
        assert!(fast.iter().any(|c| c.kind == ProbeKind::Traceroute));
        // Continuous pings keep going for both targets while the chain stalls
        assert!(slow.iter().filter(|c| c.is_single_ping()).count() >= 3);

        time::sleep(Duration::from_secs(10)).await;
        finish(handle).await;
        let records = collect(rx).await;

        let throughput = comprehensive(&records, "10.0.0.2")
            .find(|r| r.result.request.kind == ProbeKind::Throughput)
            .unwrap();
        assert!(!throughput.result.success);
        assert!(matches!(throughput.result.error, Some(ProbeError::Timeout(_))));
        assert_eq!(alert_kinds(throughput), vec![AlertKind::ThroughputFailed]);
        assert_eq!(
            comprehensive_kinds(&records, "10.0.0.2").last(),
            Some(&ProbeKind::Traceroute)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_checks_fail_fast() {
        let runner = Arc::new(FakeRunner {
            closed_ports: vec![9090],
            ..FakeRunner::healthy()
        });
        let (handle, rx) = start(config(&["10.0.0.2"], &[8080, 9090, 7070]), runner.clone());

        time::sleep(Duration::from_millis(500)).await;
        finish(handle).await;
        let records = collect(rx).await;

        let checked: Vec<String> = runner
            .calls()
            .iter()
            .filter(|c| c.kind == ProbeKind::PortCheck)
            .filter_map(|c| c.args.last().cloned())
            .collect();
        assert_eq!(checked, vec!["8080", "9090"]);

        let ports: Vec<_> = comprehensive(&records, "10.0.0.2")
            .filter(|r| r.result.request.kind == ProbeKind::PortCheck)
            .collect();
        assert_eq!(ports.len(), 1);
        assert!(!ports[0].result.success);
        assert_eq!(
            ports[0].result.ports,
            vec![
                PortStatus { port: 8080, connected: true },
                PortStatus { port: 9090, connected: false },
            ]
        );

        let closed: Vec<_> = records
            .iter()
            .flat_map(|r| r.alerts.iter())
            .filter(|a| a.kind == AlertKind::PortClosed)
            .collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].port, Some(9090));
        // The rest of the chain still runs
        assert_eq!(comprehensive_kinds(&records, "10.0.0.2"), CHAIN_KINDS.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_target_alerts() {
        let runner = Arc::new(FakeRunner {
            unreachable: vec!["10.0.0.2".into()],
            ..FakeRunner::healthy()
        });
        let (handle, rx) = start(config(&["10.0.0.2", "10.0.0.3"], &[8080, 9090]), runner.clone());

        time::sleep(Duration::from_millis(2500)).await;
        finish(handle).await;
        let records = collect(rx).await;

        let chain: Vec<(ProbeKind, Vec<AlertKind>)> = comprehensive(&records, "10.0.0.2")
            .map(|r| (r.result.request.kind, alert_kinds(r)))
            .collect();
        assert_eq!(
            chain,
            vec![
                (ProbeKind::Ping, vec![AlertKind::Unreachable]),
                (ProbeKind::PortCheck, vec![AlertKind::PortClosed]),
                (ProbeKind::Throughput, vec![AlertKind::ThroughputFailed]),
                (ProbeKind::Traceroute, vec![]),
            ]
        );

        let pings: Vec<&Recorded> = records
            .iter()
            .filter(|r| r.result.request.cadence == Cadence::Continuous)
            .filter(|r| r.result.request.target.address == "10.0.0.2")
            .collect();
        assert!(pings.len() >= 2);
        for ping in pings {
            assert!(!ping.result.success);
            assert_eq!(alert_kinds(ping), vec![AlertKind::Unreachable]);
        }

        // The reachable peer is unaffected
        assert!(comprehensive(&records, "10.0.0.3").all(|r| r.alerts.is_empty()));
        assert_eq!(
            runner
                .calls_to("10.0.0.2")
                .iter()
                .filter(|c| c.kind == ProbeKind::PortCheck)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_address_is_skipped() {
        let runner = Arc::new(FakeRunner::healthy());
        let (handle, rx) = start(config(&["10.0.0.1", "10.0.0.2"], &[22]), runner.clone());

        time::sleep(Duration::from_millis(2500)).await;
        finish(handle).await;
        let records = collect(rx).await;

        assert!(runner
            .calls()
            .iter()
            .filter(|c| !c.kind.is_local())
            .all(|c| !c.mentions("10.0.0.1")));
        assert!(records
            .iter()
            .filter(|r| r.result.request.target.address == "10.0.0.1")
            .all(|r| r.result.request.kind.is_local()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_local_kinds_without_remote_targets() {
        let runner = Arc::new(FakeRunner::healthy());
        let (handle, rx) = start(config(&["10.0.0.1"], &[22]), runner.clone());

        time::sleep(Duration::from_millis(500)).await;
        finish(handle).await;
        let records = collect(rx).await;

        let kinds: Vec<_> = records.iter().map(|r| r.result.request.kind).collect();
        assert_eq!(kinds, LOCAL_KINDS.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_dispatches_nothing_new() {
        let runner = Arc::new(
            FakeRunner::healthy().stall("10.0.0.2", ProbeKind::Throughput, Duration::from_secs(8)),
        );
        let (handle, rx) = start(config(&["10.0.0.2"], &[22]), runner.clone());

        time::sleep(Duration::from_secs(2)).await;
        handle.stop();
        let calls_at_stop = runner.calls().len();

        handle.join().await;
        time::sleep(Duration::from_secs(120)).await;
        let records = collect(rx).await;

        // The stalled throughput run finished, but neither traceroute nor
        // local probes were started afterwards.
        assert_eq!(runner.calls().len(), calls_at_stop);
        assert_eq!(runner.count(ProbeKind::Traceroute), 0);
        assert_eq!(runner.count(ProbeKind::SocketStats), 0);
        assert!(records
            .iter()
            .any(|r| r.result.request.kind == ProbeKind::Throughput && r.result.success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_dispatch() {
        let runner = Arc::new(
            FakeRunner::healthy().stall("10.0.0.2", ProbeKind::Throughput, Duration::from_secs(8)),
        );
        let (handle, rx) = start(config(&["10.0.0.2"], &[22]), runner.clone());

        time::sleep(Duration::from_secs(2)).await;
        drop(handle);
        let calls_at_drop = runner.calls().len();

        let records = collect(rx).await;

        assert_eq!(runner.calls().len(), calls_at_drop);
        assert_eq!(runner.count(ProbeKind::Traceroute), 0);
        assert_eq!(runner.count(ProbeKind::SocketStats), 0);
        assert!(records
            .iter()
            .any(|r| r.result.request.kind == ProbeKind::Throughput));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_repeat_on_interval() {
        let runner = Arc::new(FakeRunner::healthy());
        let mut cfg = config(&["10.0.0.2"], &[22]);
        cfg.interval = Duration::from_secs(10);
        cfg.ping_interval = Duration::from_secs(5);
        let (handle, rx) = start(cfg, runner.clone());

        time::sleep(Duration::from_secs(25)).await;
        finish(handle).await;
        drop(rx);

        // Ticks at 0s, 10s and 20s
        assert_eq!(runner.count(ProbeKind::Traceroute), 3);
        // Ticks at 0, 5, 10, 15, 20 and 25s
        let single = runner.calls().iter().filter(|c| c.is_single_ping()).count();
        assert!((5..=6).contains(&single));
    }
}
