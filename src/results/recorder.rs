//! Single consumer of probe outcomes.
//!
//! Probe tasks never touch the aggregator or the log files directly; they send
//! a [`Recorded`] over the channel and this task applies it.

use super::{Aggregator, LineSink, Recorded};
use crate::alert::Alert;
use crate::probe::{Cadence, Metric, ProbeResult};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const RECORD_CHANNEL_SIZE: usize = 1024;

pub type RecordTx = mpsc::Sender<Recorded>;
pub type RecordRx = mpsc::Receiver<Recorded>;

pub fn record_channel() -> (RecordTx, RecordRx) {
    mpsc::channel(RECORD_CHANNEL_SIZE)
}

struct Output {
    name: &'static str,
    sink: Box<dyn LineSink>,
    failed: bool,
}

impl Output {
    fn write(&mut self, line: &str) {
        if let Err(e) = self.sink.write_line(line) {
            // Report once; the aggregator still receives everything.
            if !self.failed {
                tracing::error!("Recorder: failed to write {} log: {}", self.name, e);
                self.failed = true;
            }
        }
    }
}

/// Applies recorded outcomes to the aggregator and the text logs.
pub struct Recorder {
    aggregator: Arc<Aggregator>,
    events: Output,
    pings: Output,
}

impl Recorder {
    pub fn new(
        aggregator: Arc<Aggregator>,
        events: Box<dyn LineSink>,
        pings: Box<dyn LineSink>,
    ) -> Self {
        Self {
            aggregator,
            events: Output {
                name: "event",
                sink: events,
                failed: false,
            },
            pings: Output {
                name: "continuous ping",
                sink: pings,
                failed: false,
            },
        }
    }

    /// Consume until every sender is dropped. Returns the number of results applied.
    pub async fn run(mut self, mut rx: RecordRx) -> usize {
        let mut applied = 0;
        while let Some(recorded) = rx.recv().await {
            self.apply(recorded);
            applied += 1;
        }
        tracing::debug!("Recorder: channel closed after {} results", applied);
        applied
    }

    fn apply(&mut self, recorded: Recorded) {
        let Recorded { result, alerts } = recorded;

        let line = format_result(&result);
        match result.request.cadence {
            Cadence::Continuous => self.pings.write(&line),
            Cadence::Comprehensive => self.events.write(&line),
        }
        for alert in &alerts {
            tracing::warn!("ALERT {}: {}", alert.kind, alert.detail);
            self.events.write(&format_alert(alert));
        }

        self.aggregator.record(result, alerts);
    }
}

fn stamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One event log line for a probe result.
pub fn format_result(result: &ProbeResult) -> String {
    let req = &result.request;
    let mut line = format!("[{}] {} {}", stamp(result.completed_at), req.kind, req.target.address);
    if let Some(port) = req.port {
        line.push_str(&format!(":{}", port));
    }
    line.push_str(if result.success { " OK" } else { " FAILED" });

    for status in &result.ports {
        let state = if status.connected { "open" } else { "closed" };
        line.push_str(&format!(" {}={}", status.port, state));
    }

    for (metric, value) in &result.metrics {
        let value = match metric {
            Metric::ThroughputMbps => format!("{:.2}", value),
            _ => value.to_string(),
        };
        line.push_str(&format!(" {}={}", metric.name(), value));
    }
    if let Some(e) = &result.error {
        line.push_str(&format!(" ({})", e));
    }
    line
}

/// One event log line for an alert.
pub fn format_alert(alert: &Alert) -> String {
    format!("[{}] ALERT {} {}", stamp(alert.timestamp), alert.kind, alert.detail)
}
