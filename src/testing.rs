//! Scripted probe runner and in-memory sink for scheduler and session tests.

use crate::probe::{Invocation, ProbeError, ProbeKind, ProbeRunner, RawOutput};
use crate::results::LineSink;

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Keeps lines in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LineSink for MemorySink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// One observed invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub kind: ProbeKind,
    pub args: Vec<String>,
}

impl Call {
    pub fn mentions(&self, addr: &str) -> bool {
        self.args.iter().any(|a| a == addr)
    }

    pub fn is_single_ping(&self) -> bool {
        self.kind == ProbeKind::Ping && self.args.get(1).map(String::as_str) == Some("1")
    }
}

/// Healthy output for every probe kind, with knobs for the failure cases.
#[derive(Default)]
pub struct FakeRunner {
    pub loss_percent: u8,
    pub avg_rtt_ms: f64,
    pub closed_ports: Vec<u16>,
    /// (address, kind) pairs that take this long to answer
    pub stalls: HashMap<(String, ProbeKind), Duration>,
    pub unreachable: Vec<String>,
    pub log: Mutex<Vec<Call>>,
}

impl FakeRunner {
    pub fn healthy() -> Self {
        Self {
            avg_rtt_ms: 15.0,
            ..Default::default()
        }
    }

    pub fn stall(mut self, addr: &str, kind: ProbeKind, delay: Duration) -> Self {
        self.stalls.insert((addr.to_string(), kind), delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls_to(&self, addr: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.mentions(addr)).collect()
    }

    pub fn count(&self, kind: ProbeKind) -> usize {
        self.calls().iter().filter(|c| c.kind == kind).count()
    }

    fn output(&self, call: &Call) -> RawOutput {
        if self.unreachable.iter().any(|a| call.mentions(a)) && call.kind != ProbeKind::Traceroute {
            return RawOutput::new("100% packet loss", 1);
        }
        match call.kind {
            ProbeKind::Ping if call.is_single_ping() => {
                RawOutput::new("64 bytes from peer: icmp_seq=1 ttl=64 time=0.500 ms", 0)
            }
            ProbeKind::Ping => RawOutput::new(
                format!(
                    "5 packets transmitted, 5 received, {}% packet loss, time 4005ms\n\
                     rtt min/avg/max/mdev = 1.000/{:.3}/30.000/1.000 ms",
                    self.loss_percent, self.avg_rtt_ms
                ),
                0,
            ),
            ProbeKind::PortCheck => {
                let closed = call
                    .args
                    .last()
                    .and_then(|p| p.parse::<u16>().ok())
                    .map_or(false, |p| self.closed_ports.contains(&p));
                RawOutput::new("", if closed { 1 } else { 0 })
            }
            ProbeKind::Throughput => RawOutput::new(
                r#"{"end":{"sum_sent":{"bits_per_second":5.02e+08},"sum_received":{"bits_per_second":500000000}}}"#,
                0,
            ),
            ProbeKind::Traceroute => RawOutput::new(" 1  10.0.0.254  0.4 ms  0.3 ms  0.3 ms\n 2  10.0.0.2  1.0 ms  1.1 ms  0.9 ms", 0),
            ProbeKind::SocketStats => RawOutput::new("ESTAB 0 0 10.0.0.1:8080 10.0.0.2:50000", 0),
            ProbeKind::TcpMetrics => RawOutput::new("    12 segments retransmitted", 0),
            ProbeKind::PacketCapture => RawOutput::new("3 packets captured", 0),
        }
    }
}

#[async_trait]
impl ProbeRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<RawOutput, ProbeError> {
        let call = Call {
            kind: invocation.kind,
            args: invocation.args.clone(),
        };
        self.log.lock().unwrap().push(call.clone());

        let stall = self
            .stalls
            .iter()
            .find(|((addr, kind), _)| *kind == call.kind && call.mentions(addr))
            .map(|(_, d)| *d);
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        Ok(self.output(&call))
    }
}
