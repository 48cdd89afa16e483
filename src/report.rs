//! End-of-run summary report.

use crate::config::Thresholds;
use crate::results::AggregateSnapshot;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;

const RULE: &str = "==========================================";

/// Facts about the run that are not derived from the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub planned_duration_secs: u64,
    pub interval_secs: u64,
    pub ping_interval_secs: u64,
    pub targets: Vec<String>,
    pub ports: Vec<u16>,
    pub local_address: Option<String>,
    pub thresholds: Thresholds,
}

impl RunMetadata {
    pub fn elapsed_secs(&self) -> i64 {
        (self.ended_at - self.started_at).num_seconds().max(0)
    }
}

/// Machine-readable form of the summary.
#[derive(Debug, Serialize)]
pub struct SummaryDocument<'a> {
    pub metadata: &'a RunMetadata,
    pub snapshot: &'a AggregateSnapshot,
}

fn stamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render the human-readable summary. Same inputs always give the same text.
pub fn render(snapshot: &AggregateSnapshot, meta: &RunMetadata) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_report(&mut out, snapshot, meta);
    out
}

fn write_report(
    out: &mut String,
    snapshot: &AggregateSnapshot,
    meta: &RunMetadata,
) -> std::fmt::Result {
    writeln!(out, "Network Health Summary")?;
    writeln!(out, "{}", RULE)?;
    writeln!(
        out,
        "Test period: {} to {}",
        stamp(snapshot.window.start),
        stamp(snapshot.window.end)
    )?;
    writeln!(
        out,
        "Duration: {}s (planned {}s)",
        meta.elapsed_secs(),
        meta.planned_duration_secs
    )?;
    writeln!(
        out,
        "Local address: {}",
        meta.local_address.as_deref().unwrap_or("unknown")
    )?;
    writeln!(out, "Targets: {}", join(&meta.targets))?;
    writeln!(out, "Ports: {}", join(&meta.ports))?;
    writeln!(
        out,
        "Intervals: comprehensive every {}s, ping every {}s",
        meta.interval_secs, meta.ping_interval_secs
    )?;
    writeln!(
        out,
        "Thresholds: latency {}ms, packet loss {}%, retransmissions {}",
        meta.thresholds.latency_ms,
        meta.thresholds.packet_loss_percent,
        meta.thresholds.retransmission_count
    )?;
    writeln!(
        out,
        "Probes: {} total, {} failed",
        snapshot.total_probes, snapshot.failed_probes
    )?;

    writeln!(out)?;
    writeln!(out, "Alerts")?;
    writeln!(out, "{}", RULE)?;
    if snapshot.alert_messages.is_empty() {
        writeln!(out, "No alerts")?;
    } else {
        writeln!(out, "Total: {}", snapshot.total_alerts())?;
        for (kind, count) in &snapshot.alert_counts {
            writeln!(out, "  {}: {}", kind, count)?;
        }
        writeln!(out, "Most frequent:")?;
        let mut messages: Vec<_> = snapshot.alert_messages.iter().collect();
        // Highest count first, ties in message order
        messages.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (message, count) in messages {
            writeln!(out, "  {:>5}  {}", count, message)?;
        }
    }

    writeln!(out)?;
    writeln!(out, "Connectivity")?;
    writeln!(out, "{}", RULE)?;
    if snapshot.per_target.is_empty() {
        writeln!(out, "No measurements")?;
    }
    for (target, stats) in &snapshot.per_target {
        writeln!(out, "{}:", target)?;
        writeln!(
            out,
            "  Ping: {} runs, {} failed",
            stats.ping_count, stats.ping_failures
        )?;
        match stats.average_latency_ms {
            Some(avg) => writeln!(out, "  Average latency: {:.2}ms", avg)?,
            None => writeln!(out, "  Average latency: not available")?,
        }
        if stats.port_checks > 0 {
            writeln!(
                out,
                "  Port checks: {} runs, {} with a closed port",
                stats.port_checks, stats.port_failures
            )?;
            for (port, count) in &stats.refused_ports {
                writeln!(out, "    port {} refused {} times", port, count)?;
            }
        }
        if stats.throughput_runs > 0 {
            write!(
                out,
                "  Throughput: {} runs, {} failed",
                stats.throughput_runs, stats.throughput_failures
            )?;
            match stats.average_throughput_mbps {
                Some(mbps) => writeln!(out, ", average {:.2} Mbps", mbps)?,
                None => writeln!(out)?,
            }
        }
        if stats.traceroute_runs > 0 {
            writeln!(
                out,
                "  Traceroute: {} runs, {} with timed out hops",
                stats.traceroute_runs, stats.path_timeouts
            )?;
        }
        writeln!(out, "  Alerts: {}", stats.alerts)?;
    }

    writeln!(out)?;
    match snapshot.overall_average_latency_ms {
        Some(avg) => writeln!(
            out,
            "Overall average latency: {:.2}ms ({} samples)",
            avg, snapshot.latency_samples
        )?,
        None => writeln!(out, "Overall average latency: not available")?,
    }
    Ok(())
}

/// Write the text and JSON summaries.
pub fn write_summary(
    text_path: &Path,
    json_path: &Path,
    report: &str,
    snapshot: &AggregateSnapshot,
    meta: &RunMetadata,
) -> std::io::Result<()> {
    std::fs::write(text_path, report)?;
    let doc = SummaryDocument {
        metadata: meta,
        snapshot,
    };
    let json = serde_json::to_string_pretty(&doc)?;
    std::fs::write(json_path, json)
}
