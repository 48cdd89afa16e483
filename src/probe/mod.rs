//! Probe module for network health checks.
//!
//! Defines what a probe is, how it is invoked through a [`ProbeRunner`], and
//! how its raw output becomes a [`ProbeResult`].

mod command;
mod extract;

pub use command::*;
pub use extract::*;

use crate::clock::Clock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

pub const PING_COUNT: u32 = 5;
pub const PING_BATCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const SINGLE_PING_TIMEOUT: Duration = Duration::from_secs(2);
pub const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const THROUGHPUT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TRACEROUTE_TIMEOUT: Duration = Duration::from_secs(60);
pub const LOCAL_STATS_TIMEOUT: Duration = Duration::from_secs(5);
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CAPTURE_PACKETS: u32 = 50;

/// Request id counter; ids are never reused within a process.
static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("could not parse output: {0}")]
    ParseFailure(String),
}

/// A remote node and the ports checked on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Target {
    pub address: String,
    pub ports: Vec<u16>,
}

impl Target {
    pub fn new(address: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            address: address.into(),
            ports,
        }
    }
}

/// The kind of diagnostic a probe runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ProbeKind {
    Ping,
    PortCheck,
    Throughput,
    Traceroute,
    SocketStats,
    TcpMetrics,
    PacketCapture,
}

impl ProbeKind {
    /// External binary that implements this probe.
    pub fn program(self) -> &'static str {
        match self {
            ProbeKind::Ping => "ping",
            ProbeKind::PortCheck => "nc",
            ProbeKind::Throughput => "iperf3",
            ProbeKind::Traceroute => "traceroute",
            ProbeKind::SocketStats => "ss",
            ProbeKind::TcpMetrics => "netstat",
            ProbeKind::PacketCapture => "tcpdump",
        }
    }

    /// Local-only probes inspect this node and run once per comprehensive cycle.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            ProbeKind::SocketStats | ProbeKind::TcpMetrics | ProbeKind::PacketCapture
        )
    }

    pub fn all() -> [ProbeKind; 7] {
        [
            ProbeKind::Ping,
            ProbeKind::PortCheck,
            ProbeKind::Throughput,
            ProbeKind::Traceroute,
            ProbeKind::SocketStats,
            ProbeKind::TcpMetrics,
            ProbeKind::PacketCapture,
        ]
    }

    fn label(self) -> &'static str {
        match self {
            ProbeKind::Ping => "PING",
            ProbeKind::PortCheck => "PORT",
            ProbeKind::Throughput => "THROUGHPUT",
            ProbeKind::Traceroute => "TRACEROUTE",
            ProbeKind::SocketStats => "SOCKETS",
            ProbeKind::TcpMetrics => "TCP",
            ProbeKind::PacketCapture => "CAPTURE",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which schedule issued a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cadence {
    Comprehensive,
    Continuous,
}

/// Named numeric measurements extracted from probe output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Metric {
    PacketLossPercent,
    AvgRttMs,
    RttMs,
    ThroughputMbps,
    HopCount,
    TimeoutHops,
    EstablishedConnections,
    Retransmissions,
    PacketsCaptured,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::PacketLossPercent => "loss_pct",
            Metric::AvgRttMs => "avg_rtt_ms",
            Metric::RttMs => "rtt_ms",
            Metric::ThroughputMbps => "throughput_mbps",
            Metric::HopCount => "hops",
            Metric::TimeoutHops => "timeout_hops",
            Metric::EstablishedConnections => "established",
            Metric::Retransmissions => "retransmissions",
            Metric::PacketsCaptured => "captured",
        }
    }
}

pub type Metrics = BTreeMap<Metric, f64>;

/// A single probe to dispatch. Consumed once by the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub id: u64,
    pub kind: ProbeKind,
    pub cadence: Cadence,
    pub target: Target,
    /// Port under test, only for port checks
    pub port: Option<u16>,
    /// Address of this node when the request was issued
    pub source: String,
    pub issued_at: DateTime<Utc>,
    pub timeout: Duration,
}

impl ProbeRequest {
    pub fn new(
        kind: ProbeKind,
        cadence: Cadence,
        target: Target,
        source: &str,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let timeout = match (kind, cadence) {
            (ProbeKind::Ping, Cadence::Continuous) => SINGLE_PING_TIMEOUT,
            (ProbeKind::Ping, Cadence::Comprehensive) => PING_BATCH_TIMEOUT,
            (ProbeKind::PortCheck, _) => PORT_CHECK_TIMEOUT,
            (ProbeKind::Throughput, _) => THROUGHPUT_TIMEOUT,
            (ProbeKind::Traceroute, _) => TRACEROUTE_TIMEOUT,
            (ProbeKind::SocketStats, _) | (ProbeKind::TcpMetrics, _) => LOCAL_STATS_TIMEOUT,
            (ProbeKind::PacketCapture, _) => CAPTURE_TIMEOUT,
        };

        Self {
            id: REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            kind,
            cadence,
            target,
            port: None,
            source: source.to_string(),
            issued_at,
            timeout,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Build the command line for this request.
    pub fn invocation(&self) -> Invocation {
        let addr = self.target.address.clone();
        let args: Vec<String> = match (self.kind, self.cadence) {
            (ProbeKind::Ping, Cadence::Continuous) => {
                vec!["-c".into(), "1".into(), "-W".into(), "1".into(), addr]
            }
            (ProbeKind::Ping, Cadence::Comprehensive) => vec![
                "-c".into(),
                PING_COUNT.to_string(),
                "-W".into(),
                "2".into(),
                addr,
            ],
            (ProbeKind::PortCheck, _) => vec![
                "-z".into(),
                "-w".into(),
                PORT_CHECK_TIMEOUT.as_secs().to_string(),
                addr,
                self.port.unwrap_or_default().to_string(),
            ],
            (ProbeKind::Throughput, _) => {
                vec!["-c".into(), addr, "-t".into(), "5".into(), "-J".into()]
            }
            (ProbeKind::Traceroute, _) => vec![
                "-n".into(),
                "-w".into(),
                "2".into(),
                "-q".into(),
                "3".into(),
                "-m".into(),
                "30".into(),
                addr,
            ],
            (ProbeKind::SocketStats, _) => vec!["-tan".into()],
            (ProbeKind::TcpMetrics, _) => vec!["-s".into()],
            (ProbeKind::PacketCapture, _) => {
                let mut args = vec![
                    "-i".into(),
                    "any".into(),
                    "-nn".into(),
                    "-c".into(),
                    CAPTURE_PACKETS.to_string(),
                ];
                let filter = self
                    .target
                    .ports
                    .iter()
                    .map(|p| format!("port {}", p))
                    .collect::<Vec<_>>()
                    .join(" or ");
                if !filter.is_empty() {
                    args.push(filter);
                }
                args
            }
        };

        Invocation {
            kind: self.kind,
            program: self.kind.program(),
            args,
            timeout: self.timeout,
        }
    }
}

/// A named diagnostic command line handed to a [`ProbeRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kind: ProbeKind,
    pub program: &'static str,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Output of one diagnostic run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawOutput {
    pub text: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl RawOutput {
    #[cfg(test)]
    pub fn new(text: impl Into<String>, exit_code: i32) -> Self {
        Self {
            text: text.into(),
            exit_code: Some(exit_code),
        }
    }

    pub fn exited_ok(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes a diagnostic against a target.
///
/// Implementations report the output even for non-zero exits; `Err` is for
/// failures to run at all. The caller enforces `invocation.timeout`.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<RawOutput, ProbeError>;
}

/// Connect outcome for one port of a port check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortStatus {
    pub port: u16,
    pub connected: bool,
}

/// The outcome of one probe. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub request: ProbeRequest,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub raw_output: String,
    pub metrics: Metrics,
    pub error: Option<ProbeError>,
    /// Per-port outcomes, in check order. Empty for every other kind.
    pub ports: Vec<PortStatus>,
}

impl ProbeResult {
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        self.metrics.get(&metric).copied()
    }

    /// First port that refused the connection.
    pub fn refused_port(&self) -> Option<u16> {
        self.ports.iter().find(|p| !p.connected).map(|p| p.port)
    }

    /// Latency sample carried by this result, if it is a ping.
    pub fn latency_ms(&self) -> Option<f64> {
        if self.request.kind != ProbeKind::Ping {
            return None;
        }
        match self.request.cadence {
            Cadence::Comprehensive => self.metric(Metric::AvgRttMs),
            Cadence::Continuous => self.metric(Metric::RttMs),
        }
    }
}

/// Run a probe and turn its output into a result.
///
/// Never fails: timeouts, execution errors and unparseable output all become
/// a result with `success == false`.
pub async fn run_probe(
    runner: &dyn ProbeRunner,
    request: ProbeRequest,
    clock: &Clock,
) -> ProbeResult {
    let invocation = request.invocation();
    let outcome = match tokio::time::timeout(request.timeout, runner.run(&invocation)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProbeError::Timeout(request.timeout)),
    };
    let completed_at = clock.now();

    match outcome {
        Ok(raw) => {
            let parsed = interpret(&request, &raw);
            ProbeResult {
                request,
                completed_at,
                success: parsed.success,
                raw_output: raw.text,
                metrics: parsed.metrics,
                error: parsed.error,
                ports: Vec::new(),
            }
        }
        Err(e) => {
            tracing::debug!("Probe {} to {} failed: {}", request.kind, request.target.address, e);
            ProbeResult {
                request,
                completed_at,
                success: false,
                raw_output: String::new(),
                metrics: Metrics::new(),
                error: Some(e),
                ports: Vec::new(),
            }
        }
    }
}

/// Check the target's ports in order and combine them into one result.
///
/// Stops at the first refused port. The result succeeds only when every
/// checked port connected; its error is the refused port's error.
pub async fn run_port_checks(
    runner: &dyn ProbeRunner,
    request: ProbeRequest,
    clock: &Clock,
) -> ProbeResult {
    let mut ports = Vec::with_capacity(request.target.ports.len());
    let mut raw_output = String::new();
    let mut error = None;

    for &port in &request.target.ports {
        let single = run_probe(runner, request.clone().with_port(port), clock).await;
        if !single.raw_output.is_empty() {
            raw_output.push_str(&single.raw_output);
        }
        ports.push(PortStatus {
            port,
            connected: single.success,
        });
        if !single.success {
            error = single.error;
            break;
        }
    }

    ProbeResult {
        completed_at: clock.now(),
        success: error.is_none() && ports.iter().all(|p| p.connected),
        raw_output,
        metrics: Metrics::new(),
        error,
        ports,
        request,
    }
}
