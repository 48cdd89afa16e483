//! Configuration module for nethealth.
//!
//! Flags fall back to `NETHEALTH_*` environment variables, then to defaults.
//! The validated [`RunConfig`] is built once at startup and never mutated.

use crate::probe::Target;

use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types. All of them abort the run before any probing.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("target list is required and must not be empty")]
    NoTargets,
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid duration for {0}: must be greater than zero")]
    InvalidDuration(&'static str),
    #[error("invalid threshold for {0}: {1}")]
    InvalidThreshold(&'static str, f64),
    #[error("invalid self address: {0}")]
    InvalidAddress(String),
}

/// Periodic network health probing for a fleet of nodes.
#[derive(Parser, Debug, Clone)]
#[command(name = "nethealth")]
#[command(about = "Probe reachability, latency, ports and throughput between this node and its peers")]
pub struct Args {
    /// Comma separated list of remote node addresses
    #[arg(short, long, env = "NETHEALTH_TARGETS")]
    pub targets: Option<String>,

    /// Comma separated list of ports checked on every target
    #[arg(short, long, env = "NETHEALTH_PORTS", default_value = "22")]
    pub ports: String,

    /// Total run duration in seconds
    #[arg(short, long, env = "NETHEALTH_DURATION", default_value_t = 300)]
    pub duration: u64,

    /// Directory for the event log, continuous ping log and summary
    #[arg(short, long, env = "NETHEALTH_LOG_DIR", default_value = "./network-test-logs")]
    pub log_dir: PathBuf,

    /// Seconds between comprehensive test cycles
    #[arg(short, long, env = "NETHEALTH_INTERVAL", default_value_t = 60)]
    pub interval: u64,

    /// Seconds between continuous ping rounds
    #[arg(long, env = "NETHEALTH_PING_INTERVAL", default_value_t = 5)]
    pub ping_interval: u64,

    /// Average latency alert threshold in milliseconds
    #[arg(long, env = "NETHEALTH_LATENCY_THRESHOLD", default_value_t = 100.0)]
    pub latency_threshold: f64,

    /// Packet loss alert threshold in percent
    #[arg(long, env = "NETHEALTH_PACKET_LOSS_THRESHOLD", default_value_t = 1.0)]
    pub packet_loss_threshold: f64,

    /// Address of this node; detected from the routing table when omitted
    #[arg(long, env = "NETHEALTH_SELF_ADDRESS")]
    pub self_address: Option<String>,

    /// Do not verify that the diagnostic binaries are installed
    #[arg(long, default_value_t = false)]
    pub skip_capability_check: bool,
}

/// Alerting thresholds, read-only once the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub latency_ms: f64,
    pub packet_loss_percent: f64,
    pub retransmission_count: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            latency_ms: 100.0,
            packet_loss_percent: 1.0,
            retransmission_count: 100,
        }
    }
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub targets: Vec<Target>,
    pub ports: Vec<u16>,
    pub duration: Duration,
    pub log_dir: PathBuf,
    /// Comprehensive cycle cadence
    pub interval: Duration,
    /// Continuous ping cadence
    pub ping_interval: Duration,
    pub thresholds: Thresholds,
    pub self_address: Option<String>,
    pub check_capabilities: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            ports: vec![22],
            duration: Duration::from_secs(300),
            log_dir: PathBuf::from("./network-test-logs"),
            interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(5),
            thresholds: Thresholds::default(),
            self_address: None,
            check_capabilities: true,
        }
    }
}

impl RunConfig {
    /// Validate parsed arguments into a run configuration.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let ports = parse_ports(&args.ports)?;
        let addresses = args
            .targets
            .as_deref()
            .map(split_list)
            .unwrap_or_default();
        if addresses.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let mut targets: Vec<Target> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if targets.iter().any(|t| t.address == address) {
                tracing::warn!("Config: duplicate target {} ignored", address);
                continue;
            }
            targets.push(Target::new(address, ports.clone()));
        }

        if args.duration == 0 {
            return Err(ConfigError::InvalidDuration("duration"));
        }
        if args.interval == 0 {
            return Err(ConfigError::InvalidDuration("interval"));
        }
        if args.ping_interval == 0 {
            return Err(ConfigError::InvalidDuration("ping-interval"));
        }
        if !(args.latency_threshold.is_finite() && args.latency_threshold >= 0.0) {
            return Err(ConfigError::InvalidThreshold(
                "latency",
                args.latency_threshold,
            ));
        }
        if !(0.0..=100.0).contains(&args.packet_loss_threshold) {
            return Err(ConfigError::InvalidThreshold(
                "packet loss",
                args.packet_loss_threshold,
            ));
        }

        let self_address = match args.self_address {
            Some(addr) if addr.trim().is_empty() => {
                return Err(ConfigError::InvalidAddress(addr));
            }
            Some(addr) => Some(addr.trim().to_string()),
            None => None,
        };

        Ok(Self {
            targets,
            ports,
            duration: Duration::from_secs(args.duration),
            log_dir: args.log_dir,
            interval: Duration::from_secs(args.interval),
            ping_interval: Duration::from_secs(args.ping_interval),
            thresholds: Thresholds {
                latency_ms: args.latency_threshold,
                packet_loss_percent: args.packet_loss_threshold,
                ..Thresholds::default()
            },
            self_address,
            check_capabilities: !args.skip_capability_check,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();
    for item in split_list(raw) {
        let port: u16 = item
            .parse()
            .map_err(|_| ConfigError::InvalidPort(item.clone()))?;
        if port == 0 {
            return Err(ConfigError::InvalidPort(item));
        }
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(ports)
}
