//! Threshold evaluation.
//!
//! Alerts are derived only from a probe result and the configured thresholds.
//! For a batch ping the checks run in order (unreachable, packet loss, latency)
//! and stop at the first one that fires.

use crate::config::Thresholds;
use crate::probe::{Cadence, Metric, ProbeKind, ProbeResult};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AlertKind {
    Unreachable,
    HighPacketLoss,
    HighLatency,
    PortClosed,
    ThroughputFailed,
    HighRetransmission,
    PathTimeout,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A threshold breach or failure. Append-only; duplicates are separate events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub kind: AlertKind,
    pub detail: String,
    pub measured_value: Option<f64>,
    pub port: Option<u16>,
}

/// Evaluate a probe result against the thresholds.
pub fn evaluate(result: &ProbeResult, thresholds: &Thresholds) -> Vec<Alert> {
    let req = &result.request;
    let target = req.target.address.as_str();
    let alert = |kind: AlertKind, detail: String, measured_value: Option<f64>| Alert {
        timestamp: result.completed_at,
        target: target.to_string(),
        kind,
        detail,
        measured_value,
        port: result.refused_port().or(req.port),
    };

    let mut alerts = Vec::new();
    match req.kind {
        ProbeKind::Ping => {
            if !result.success {
                alerts.push(alert(
                    AlertKind::Unreachable,
                    format!("Host {} is unreachable from {}", target, req.source),
                    None,
                ));
                return alerts;
            }

            if req.cadence == Cadence::Comprehensive {
                if let Some(loss) = result
                    .metric(Metric::PacketLossPercent)
                    .filter(|loss| *loss > thresholds.packet_loss_percent)
                {
                    alerts.push(alert(
                        AlertKind::HighPacketLoss,
                        format!("High packet loss to {}: {}%", target, loss),
                        Some(loss),
                    ));
                    return alerts;
                }
            }

            if let Some(rtt) = result
                .latency_ms()
                .filter(|rtt| *rtt > thresholds.latency_ms)
            {
                alerts.push(alert(
                    AlertKind::HighLatency,
                    format!("High latency to {}: {:.2}ms", target, rtt),
                    Some(rtt),
                ));
            }
        }
        ProbeKind::PortCheck => {
            if !result.success {
                let port = result.refused_port().or(req.port).unwrap_or_default();
                alerts.push(alert(
                    AlertKind::PortClosed,
                    format!("Port {} on {} is not reachable from {}", port, target, req.source),
                    None,
                ));
            }
        }
        ProbeKind::Throughput => {
            if !result.success {
                alerts.push(alert(
                    AlertKind::ThroughputFailed,
                    format!("Throughput test to {} failed", target),
                    None,
                ));
            }
        }
        ProbeKind::TcpMetrics => {
            if let Some(count) = result
                .metric(Metric::Retransmissions)
                .filter(|n| *n > thresholds.retransmission_count as f64)
            {
                alerts.push(alert(
                    AlertKind::HighRetransmission,
                    format!("High TCP retransmission count: {}", count),
                    Some(count),
                ));
            }
        }
        ProbeKind::Traceroute => {
            if let Some(hops) = result.metric(Metric::TimeoutHops).filter(|n| *n > 0.0) {
                alerts.push(alert(
                    AlertKind::PathTimeout,
                    format!("Path to {} has {} timed out hops", target, hops),
                    Some(hops),
                ));
            }
        }
        ProbeKind::SocketStats | ProbeKind::PacketCapture => {}
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Metrics, PortStatus, ProbeError, ProbeRequest, Target};

    fn result(kind: ProbeKind, cadence: Cadence, success: bool, metrics: &[(Metric, f64)]) -> ProbeResult {
        let request = ProbeRequest::new(
            kind,
            cadence,
            Target::new("10.0.0.2", vec![8080]),
            "10.0.0.1",
            Utc::now(),
        );
        ProbeResult {
            request,
            completed_at: Utc::now(),
            success,
            raw_output: String::new(),
            metrics: metrics.iter().copied().collect::<Metrics>(),
            error: if success {
                None
            } else {
                Some(ProbeError::Execution("exit 1".into()))
            },
            ports: Vec::new(),
        }
    }

    fn kinds(alerts: &[Alert]) -> Vec<AlertKind> {
        alerts.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_latency_just_over_threshold() {
        let thresholds = Thresholds::default();
        let eps = 0.001;
        for loss in [None, Some(0.0)] {
            let mut m = vec![(Metric::AvgRttMs, thresholds.latency_ms + eps)];
            if let Some(l) = loss {
                m.push((Metric::PacketLossPercent, l));
            }
            let alerts = evaluate(&result(ProbeKind::Ping, Cadence::Comprehensive, true, &m), &thresholds);
            assert_eq!(kinds(&alerts), vec![AlertKind::HighLatency]);
            assert_eq!(alerts[0].measured_value, Some(thresholds.latency_ms + eps));
        }

        let at = [(Metric::AvgRttMs, thresholds.latency_ms)];
        let alerts = evaluate(&result(ProbeKind::Ping, Cadence::Comprehensive, true, &at), &thresholds);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_unreachable_takes_priority() {
        let m = [(Metric::PacketLossPercent, 100.0), (Metric::AvgRttMs, 900.0)];
        for cadence in [Cadence::Comprehensive, Cadence::Continuous] {
            let alerts = evaluate(&result(ProbeKind::Ping, cadence, false, &m), &Thresholds::default());
            assert_eq!(kinds(&alerts), vec![AlertKind::Unreachable]);
            assert_eq!(alerts[0].measured_value, None);
        }
    }

    #[test]
    fn test_packet_loss_short_circuits_latency() {
        let m = [(Metric::PacketLossPercent, 5.0), (Metric::AvgRttMs, 500.0)];
        let alerts = evaluate(&result(ProbeKind::Ping, Cadence::Comprehensive, true, &m), &Thresholds::default());
        assert_eq!(kinds(&alerts), vec![AlertKind::HighPacketLoss]);
        assert_eq!(alerts[0].measured_value, Some(5.0));
        assert!(alerts[0].detail.contains("5%"));
    }

    #[test]
    fn test_single_ping_only_latency() {
        let thresholds = Thresholds::default();
        let m = [(Metric::RttMs, 250.0), (Metric::PacketLossPercent, 100.0)];
        let alerts = evaluate(&result(ProbeKind::Ping, Cadence::Continuous, true, &m), &thresholds);
        assert_eq!(kinds(&alerts), vec![AlertKind::HighLatency]);

        let m = [(Metric::RttMs, 0.4)];
        let alerts = evaluate(&result(ProbeKind::Ping, Cadence::Continuous, true, &m), &thresholds);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_port_closed_identifies_port() {
        let mut r = result(ProbeKind::PortCheck, Cadence::Comprehensive, false, &[]);
        r.ports = vec![
            PortStatus { port: 8080, connected: true },
            PortStatus { port: 9090, connected: false },
        ];
        let alerts = evaluate(&r, &Thresholds::default());
        assert_eq!(kinds(&alerts), vec![AlertKind::PortClosed]);
        assert_eq!(alerts[0].port, Some(9090));
        assert!(alerts[0].detail.contains("9090"));
        assert!(alerts[0].detail.contains("10.0.0.1"));
    }

    #[test]
    fn test_other_kinds() {
        let thresholds = Thresholds::default();

        let alerts = evaluate(&result(ProbeKind::Throughput, Cadence::Comprehensive, false, &[]), &thresholds);
        assert_eq!(kinds(&alerts), vec![AlertKind::ThroughputFailed]);

        let m = [(Metric::Retransmissions, 101.0)];
        let alerts = evaluate(&result(ProbeKind::TcpMetrics, Cadence::Comprehensive, true, &m), &thresholds);
        assert_eq!(kinds(&alerts), vec![AlertKind::HighRetransmission]);
        let m = [(Metric::Retransmissions, 100.0)];
        assert!(evaluate(&result(ProbeKind::TcpMetrics, Cadence::Comprehensive, true, &m), &thresholds).is_empty());

        let m = [(Metric::HopCount, 8.0), (Metric::TimeoutHops, 2.0)];
        let alerts = evaluate(&result(ProbeKind::Traceroute, Cadence::Comprehensive, true, &m), &thresholds);
        assert_eq!(kinds(&alerts), vec![AlertKind::PathTimeout]);
        assert_eq!(alerts[0].measured_value, Some(2.0));

        let m = [(Metric::HopCount, 8.0), (Metric::TimeoutHops, 0.0)];
        assert!(evaluate(&result(ProbeKind::Traceroute, Cadence::Comprehensive, true, &m), &thresholds).is_empty());
    }
}
