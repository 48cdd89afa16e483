//! Metric extraction from diagnostic tool output.
//!
//! Every parser is a pure function over text. Missing or malformed fields are
//! omitted from the result rather than reported as zero.

use super::{Cadence, Metric, Metrics, ProbeError, ProbeKind, ProbeRequest, RawOutput};

use regex::Regex;
use std::sync::OnceLock;

/// Success flag, metrics and error derived from a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub success: bool,
    pub metrics: Metrics,
    pub error: Option<ProbeError>,
}

impl Interpretation {
    fn ok(metrics: Metrics) -> Self {
        Self {
            success: true,
            metrics,
            error: None,
        }
    }

    fn failed(metrics: Metrics, error: ProbeError) -> Self {
        Self {
            success: false,
            metrics,
            error: Some(error),
        }
    }
}

/// Interpret raw output for the given request.
pub fn interpret(request: &ProbeRequest, raw: &RawOutput) -> Interpretation {
    let text = raw.text.as_str();
    let exit_error = || {
        let status = raw
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        ProbeError::Execution(format!("{} exited with status {}", request.kind.program(), status))
    };

    match request.kind {
        ProbeKind::Ping => {
            let metrics = match request.cadence {
                Cadence::Comprehensive => parse_ping_summary(text),
                Cadence::Continuous => parse_single_ping(text),
            };
            if !raw.exited_ok() {
                Interpretation::failed(metrics, exit_error())
            } else if metrics.is_empty() {
                Interpretation::failed(metrics, parse_error("ping", text))
            } else {
                Interpretation::ok(metrics)
            }
        }
        ProbeKind::PortCheck => {
            if raw.exited_ok() {
                Interpretation::ok(Metrics::new())
            } else {
                let port = request.port.unwrap_or_default();
                Interpretation::failed(
                    Metrics::new(),
                    ProbeError::Execution(format!("connection to port {} refused", port)),
                )
            }
        }
        ProbeKind::Throughput => {
            let mut metrics = Metrics::new();
            if let Some(bps) = parse_throughput_bps(text) {
                metrics.insert(Metric::ThroughputMbps, bps / 1_000_000.0);
            }
            if !raw.exited_ok() {
                Interpretation::failed(metrics, exit_error())
            } else if metrics.is_empty() {
                Interpretation::failed(metrics, parse_error("iperf3", text))
            } else {
                Interpretation::ok(metrics)
            }
        }
        ProbeKind::Traceroute => {
            let metrics = parse_traceroute(text);
            // traceroute exits non-zero when the destination is never reached;
            // the hops it did print are still meaningful.
            if !metrics.is_empty() {
                Interpretation::ok(metrics)
            } else if !raw.exited_ok() {
                Interpretation::failed(metrics, exit_error())
            } else {
                Interpretation::failed(metrics, parse_error("traceroute", text))
            }
        }
        ProbeKind::SocketStats => {
            if !raw.exited_ok() {
                return Interpretation::failed(Metrics::new(), exit_error());
            }
            let mut metrics = Metrics::new();
            let count = count_established(text, &request.target.ports);
            metrics.insert(Metric::EstablishedConnections, count as f64);
            Interpretation::ok(metrics)
        }
        ProbeKind::TcpMetrics => {
            if !raw.exited_ok() {
                return Interpretation::failed(Metrics::new(), exit_error());
            }
            match parse_retransmissions(text) {
                Some(n) => {
                    let mut metrics = Metrics::new();
                    metrics.insert(Metric::Retransmissions, n as f64);
                    Interpretation::ok(metrics)
                }
                None => Interpretation::failed(Metrics::new(), parse_error("netstat", text)),
            }
        }
        ProbeKind::PacketCapture => {
            let mut metrics = Metrics::new();
            if let Some(n) = parse_captured_packets(text) {
                metrics.insert(Metric::PacketsCaptured, n as f64);
            }
            if raw.exited_ok() {
                Interpretation::ok(metrics)
            } else {
                Interpretation::failed(metrics, exit_error())
            }
        }
    }
}

fn parse_error(tool: &str, text: &str) -> ProbeError {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    ProbeError::ParseFailure(format!("no metrics in {} output: {:?}", tool, first))
}

/// Packet loss percent and average RTT from a batch ping summary.
pub fn parse_ping_summary(output: &str) -> Metrics {
    static LOSS: OnceLock<Regex> = OnceLock::new();
    let loss = LOSS.get_or_init(|| Regex::new(r"(?P<pct>\d+)(?:\.\d+)?% packet loss").unwrap());

    // Linux "rtt min/avg/max/mdev" and macOS "round-trip min/avg/max/stddev"
    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt = RTT.get_or_init(|| {
        Regex::new(
            r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)",
        )
        .unwrap()
    });

    let mut metrics = Metrics::new();

    if let Some(pct) = loss
        .captures(output)
        .and_then(|c| c.name("pct"))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(|p| *p <= 100)
    {
        metrics.insert(Metric::PacketLossPercent, f64::from(pct));
    }

    if let Some(avg) = rtt
        .captures(output)
        .and_then(|c| c.get(2))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        metrics.insert(Metric::AvgRttMs, avg);
    }

    metrics
}

/// Round-trip time of a single echo reply.
pub fn parse_single_ping(output: &str) -> Metrics {
    static TIME: OnceLock<Regex> = OnceLock::new();
    let time = TIME.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    let mut metrics = Metrics::new();
    if let Some(ms) = time
        .captures(output)
        .and_then(|c| c.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        metrics.insert(Metric::RttMs, ms);
    }
    metrics
}

/// Receiver-side bits per second from iperf3 output.
///
/// Reads the JSON report when it is intact, otherwise takes the last
/// `bits_per_second` field found in the text.
pub fn parse_throughput_bps(output: &str) -> Option<f64> {
    if let Ok(doc) = serde_json::from_str::<serde_json::Value>(output) {
        let end = &doc["end"];
        let bps = end["sum_received"]["bits_per_second"]
            .as_f64()
            .or_else(|| end["sum_sent"]["bits_per_second"].as_f64())
            .or_else(|| end["sum"]["bits_per_second"].as_f64());
        if bps.is_some() {
            return bps;
        }
    }

    static BPS: OnceLock<Regex> = OnceLock::new();
    let re = BPS.get_or_init(|| {
        Regex::new(r#""?bits_per_second"?\s*[:=]\s*(?P<val>[-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)"#)
            .unwrap()
    });

    re.captures_iter(output)
        .filter_map(|c| c.name("val").and_then(|m| m.as_str().parse::<f64>().ok()))
        .filter(|v| v.is_finite() && *v >= 0.0)
        .last()
}

/// Hop count and number of hops where every probe timed out.
pub fn parse_traceroute(output: &str) -> Metrics {
    static HOP: OnceLock<Regex> = OnceLock::new();
    let hop = HOP.get_or_init(|| Regex::new(r"^\s*(?P<n>\d+)\s+(?P<rest>.*)$").unwrap());

    let mut hops = 0u32;
    let mut timeouts = 0u32;
    for line in output.lines() {
        let Some(caps) = hop.captures(line) else {
            continue;
        };
        let rest = caps.name("rest").map(|m| m.as_str().trim()).unwrap_or("");
        hops += 1;
        if !rest.is_empty() && rest.split_whitespace().all(|tok| tok == "*") {
            timeouts += 1;
        }
    }

    let mut metrics = Metrics::new();
    if hops > 0 {
        metrics.insert(Metric::HopCount, f64::from(hops));
        metrics.insert(Metric::TimeoutHops, f64::from(timeouts));
    }
    metrics
}

/// Established TCP connections whose local or peer port is in `ports`.
///
/// Accepts `ss -tan` and `netstat -tan` layouts. An empty port set counts all.
pub fn count_established(output: &str, ports: &[u16]) -> usize {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.first() {
                // ss: State Recv-Q Send-Q Local Peer
                Some(&"ESTAB") if cols.len() >= 5 => Some((cols[3], cols[4])),
                // netstat: Proto Recv-Q Send-Q Local Foreign State
                Some(_) if cols.len() >= 6 && cols[5] == "ESTABLISHED" => Some((cols[3], cols[4])),
                _ => None,
            }
        })
        .filter(|(local, peer)| {
            ports.is_empty() || [local, peer].iter().any(|addr| {
                endpoint_port(addr).map_or(false, |p| ports.contains(&p))
            })
        })
        .count()
}

fn endpoint_port(endpoint: &str) -> Option<u16> {
    endpoint
        .rsplit(|c| c == ':' || c == '.')
        .next()
        .and_then(|p| p.parse().ok())
}

/// Retransmitted segment count from host TCP statistics.
pub fn parse_retransmissions(output: &str) -> Option<u64> {
    static NETSTAT: OnceLock<Regex> = OnceLock::new();
    let netstat = NETSTAT.get_or_init(|| {
        Regex::new(r"(?P<n>\d+)\s+segments\s+retransmit+ed").unwrap()
    });
    static NSTAT: OnceLock<Regex> = OnceLock::new();
    let nstat = NSTAT.get_or_init(|| Regex::new(r"TcpRetransSegs\s+(?P<n>\d+)").unwrap());

    netstat
        .captures(output)
        .or_else(|| nstat.captures(output))
        .and_then(|c| c.name("n"))
        .and_then(|m| m.as_str().parse().ok())
}

/// Packets captured, from tcpdump's exit summary.
pub fn parse_captured_packets(output: &str) -> Option<u64> {
    static CAPTURED: OnceLock<Regex> = OnceLock::new();
    let re = CAPTURED.get_or_init(|| Regex::new(r"(?P<n>\d+)\s+packets?\s+captured").unwrap());
    re.captures(output)
        .and_then(|c| c.name("n"))
        .and_then(|m| m.as_str().parse().ok())
}
