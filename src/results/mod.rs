//! Result collection for nethealth.
//!
//! Probe outcomes and alerts flow through a channel into the recorder, which
//! appends them to the in-memory event log and the text sinks.

mod recorder;
mod sink;
mod store;

pub use recorder::*;
pub use sink::*;
pub use store::*;

use crate::alert::{Alert, AlertKind};
use crate::probe::ProbeResult;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One entry of the append-only event log.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Probe(ProbeResult),
    Alert(Alert),
}

impl Event {
    pub fn target(&self) -> &str {
        match self {
            Event::Probe(r) => &r.request.target.address,
            Event::Alert(a) => &a.target,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Probe(r) => r.completed_at,
            Event::Alert(a) => a.timestamp,
        }
    }
}

/// A finished probe together with the alerts it raised.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub result: ProbeResult,
    pub alerts: Vec<Alert>,
}

/// Inclusive time range a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Per-target counters over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetStats {
    pub probes: usize,
    pub ping_count: usize,
    pub ping_failures: usize,
    /// Port check runs; each covers every configured port until one refuses
    pub port_checks: usize,
    pub port_failures: usize,
    /// Refusal count per port
    pub refused_ports: BTreeMap<u16, usize>,
    pub throughput_runs: usize,
    pub throughput_failures: usize,
    pub traceroute_runs: usize,
    pub path_timeouts: usize,
    pub alerts: usize,
    pub average_latency_ms: Option<f64>,
    pub average_throughput_mbps: Option<f64>,
}

/// Statistics derived from the event log. Recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub window: TimeWindow,
    pub total_probes: usize,
    pub failed_probes: usize,
    pub per_target: BTreeMap<String, TargetStats>,
    pub alert_counts: BTreeMap<AlertKind, usize>,
    /// Identical alert lines grouped and counted
    pub alert_messages: BTreeMap<String, usize>,
    pub latency_samples: usize,
    /// `None` when no ping measurement exists in the window
    pub overall_average_latency_ms: Option<f64>,
}

impl AggregateSnapshot {
    pub fn total_alerts(&self) -> usize {
        self.alert_counts.values().sum()
    }
}
