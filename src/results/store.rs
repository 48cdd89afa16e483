//! Thread-safe append-only event log and snapshot computation.

use super::{AggregateSnapshot, Event, TargetStats, TimeWindow};
use crate::alert::Alert;
use crate::probe::{Metric, ProbeKind, ProbeResult};

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Collects probe results and alerts for the duration of a run.
///
/// Writers append under a short write lock. Snapshots clone the matching
/// `Arc`s under a read lock and compute outside of it.
#[derive(Debug, Default)]
pub struct Aggregator {
    log: RwLock<Vec<Arc<Event>>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result and its alerts as one contiguous block.
    pub fn record(&self, result: ProbeResult, alerts: Vec<Alert>) {
        let mut block = Vec::with_capacity(1 + alerts.len());
        block.push(Arc::new(Event::Probe(result)));
        block.extend(alerts.into_iter().map(|a| Arc::new(Event::Alert(a))));

        self.write().extend(block);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute statistics over events whose timestamp falls in `window`.
    pub fn snapshot(&self, window: TimeWindow) -> AggregateSnapshot {
        let events: Vec<Arc<Event>> = self
            .read()
            .iter()
            .filter(|e| window.contains(e.timestamp()))
            .cloned()
            .collect();

        summarize(window, &events)
    }

    // A poisoned lock only means a writer panicked between pushes; the log
    // itself is still a valid prefix.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Event>>> {
        self.log.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Event>>> {
        self.log.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

fn summarize(window: TimeWindow, events: &[Arc<Event>]) -> AggregateSnapshot {
    let mut per_target: BTreeMap<String, TargetStats> = BTreeMap::new();
    let mut latency: BTreeMap<String, Mean> = BTreeMap::new();
    let mut throughput: BTreeMap<String, Mean> = BTreeMap::new();
    let mut overall = Mean::default();
    let mut snapshot = AggregateSnapshot {
        window,
        total_probes: 0,
        failed_probes: 0,
        per_target: BTreeMap::new(),
        alert_counts: BTreeMap::new(),
        alert_messages: BTreeMap::new(),
        latency_samples: 0,
        overall_average_latency_ms: None,
    };

    for event in events {
        let stats = per_target.entry(event.target().to_string()).or_default();
        match event.as_ref() {
            Event::Probe(r) => {
                snapshot.total_probes += 1;
                stats.probes += 1;
                if !r.success {
                    snapshot.failed_probes += 1;
                }

                match r.request.kind {
                    ProbeKind::Ping => {
                        stats.ping_count += 1;
                        if !r.success {
                            stats.ping_failures += 1;
                        }
                        if let Some(ms) = r.latency_ms() {
                            overall.add(ms);
                            latency.entry(event.target().to_string()).or_default().add(ms);
                        }
                    }
                    ProbeKind::PortCheck => {
                        stats.port_checks += 1;
                        if !r.success {
                            stats.port_failures += 1;
                        }
                        for refused in r.ports.iter().filter(|p| !p.connected) {
                            *stats.refused_ports.entry(refused.port).or_default() += 1;
                        }
                    }
                    ProbeKind::Throughput => {
                        stats.throughput_runs += 1;
                        if !r.success {
                            stats.throughput_failures += 1;
                        }
                        if let Some(mbps) = r.metric(Metric::ThroughputMbps) {
                            throughput.entry(event.target().to_string()).or_default().add(mbps);
                        }
                    }
                    ProbeKind::Traceroute => {
                        stats.traceroute_runs += 1;
                        if r.metric(Metric::TimeoutHops).map_or(false, |n| n > 0.0) {
                            stats.path_timeouts += 1;
                        }
                    }
                    ProbeKind::SocketStats | ProbeKind::TcpMetrics | ProbeKind::PacketCapture => {}
                }
            }
            Event::Alert(a) => {
                stats.alerts += 1;
                *snapshot.alert_counts.entry(a.kind).or_default() += 1;
                *snapshot.alert_messages.entry(a.detail.clone()).or_default() += 1;
            }
        }
    }

    for (target, stats) in per_target.iter_mut() {
        stats.average_latency_ms = latency.get(target).and_then(Mean::value);
        stats.average_throughput_mbps = throughput.get(target).and_then(Mean::value);
    }

    snapshot.per_target = per_target;
    snapshot.latency_samples = overall.count;
    snapshot.overall_average_latency_ms = overall.value();
    snapshot
}
