//! One complete measurement run.
//!
//! A session starts the scheduler, waits for the deadline or an interrupt,
//! stops dispatching, then reports on the window from start to that moment.
//! Probes still running at the deadline may finish into the text logs but
//! never into the summary.

use crate::clock::Clock;
use crate::config::{ConfigError, RunConfig};
use crate::probe::{CapabilityReport, ProbeRunner};
use crate::report::{self, RunMetadata};
use crate::results::{
    record_channel, AggregateSnapshot, Aggregator, FileSink, LineSink, Recorder, TimeWindow,
};
use crate::scheduler::{Scheduler, SelfAddress};

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a stopped session waits for in-flight probes before reporting.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("required program not installed: {0}")]
    MissingCapability(String),
    #[error("cannot create output: {0}")]
    Sink(#[from] io::Error),
}

impl SessionError {
    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            SessionError::Config(_) => exitcode::CONFIG,
            SessionError::MissingCapability(_) => exitcode::UNAVAILABLE,
            SessionError::Sink(_) => exitcode::CANTCREAT,
        }
    }
}

/// Fail when a required program is missing; warn about optional ones.
pub fn verify_capabilities(report: &CapabilityReport) -> Result<(), SessionError> {
    for program in &report.missing_optional {
        tracing::warn!("{} not found, its probes will fail and be recorded", program);
    }
    if report.is_usable() {
        Ok(())
    } else {
        Err(SessionError::MissingCapability(report.missing_required.join(", ")))
    }
}

/// Where a session writes its text artifacts.
pub struct Outputs {
    pub events: Box<dyn LineSink>,
    pub pings: Box<dyn LineSink>,
    pub summary_text: Option<PathBuf>,
    pub summary_json: Option<PathBuf>,
}

impl Outputs {
    /// Log files under `dir`, all named with the same run stamp.
    pub fn in_dir(dir: &Path, stamp: &str) -> Result<Self, SessionError> {
        std::fs::create_dir_all(dir)?;
        let events = FileSink::create(dir.join(format!("network_test_{}.log", stamp)))?;
        let pings = FileSink::create(dir.join(format!("continuous_ping_{}.log", stamp)))?;
        tracing::info!("Writing event log to {}", events.path().display());
        tracing::info!("Writing continuous ping log to {}", pings.path().display());

        Ok(Self {
            events: Box::new(events),
            pings: Box::new(pings),
            summary_text: Some(dir.join(format!("summary_{}.txt", stamp))),
            summary_json: Some(dir.join(format!("summary_{}.json", stamp))),
        })
    }

    /// Caller-supplied sinks, no summary files.
    #[cfg(test)]
    pub fn new(events: Box<dyn LineSink>, pings: Box<dyn LineSink>) -> Self {
        Self {
            events,
            pings,
            summary_text: None,
            summary_json: None,
        }
    }
}

/// What a finished session produced.
#[derive(Debug)]
pub struct SessionOutcome {
    pub snapshot: AggregateSnapshot,
    pub metadata: RunMetadata,
    pub report: String,
}

pub struct Session {
    config: Arc<RunConfig>,
    runner: Arc<dyn ProbeRunner>,
    resolver: Arc<dyn SelfAddress>,
}

impl Session {
    pub fn new(
        config: RunConfig,
        runner: Arc<dyn ProbeRunner>,
        resolver: Arc<dyn SelfAddress>,
    ) -> Result<Self, SessionError> {
        if config.targets.is_empty() {
            return Err(ConfigError::NoTargets.into());
        }
        Ok(Self {
            config: Arc::new(config),
            runner,
            resolver,
        })
    }

    /// Run until the configured duration elapses or `interrupt` completes.
    pub async fn run(
        self,
        outputs: Outputs,
        interrupt: impl Future<Output = ()>,
    ) -> Result<SessionOutcome, SessionError> {
        let clock = Clock::new();
        let started_at = clock.now();
        let aggregator = Arc::new(Aggregator::new());

        let (record_tx, record_rx) = record_channel();
        let recorder = Recorder::new(aggregator.clone(), outputs.events, outputs.pings);
        let recorder = tokio::spawn(recorder.run(record_rx));

        let scheduler = Scheduler::new(
            self.config.clone(),
            self.runner.clone(),
            self.resolver.clone(),
            clock,
        );
        let handle = scheduler.start(record_tx);

        tracing::info!(
            "Session started, running for {:?} against {} targets",
            self.config.duration,
            self.config.targets.len()
        );
        tokio::select! {
            _ = tokio::time::sleep(self.config.duration) => {
                tracing::info!("Session: duration elapsed");
            }
            _ = interrupt => {
                tracing::info!("Session: interrupted, stopping early");
            }
        }
        let ended_at = clock.now();
        handle.stop();

        // Stragglers are not waited for; the recorder keeps logging them
        match tokio::time::timeout(SHUTDOWN_GRACE, handle.join()).await {
            Ok(()) => {
                if let Err(e) = recorder.await {
                    tracing::error!("Session: recorder task failed: {}", e);
                }
            }
            Err(_) => tracing::warn!(
                "Session: probes still running after {:?}, leaving them out of the summary",
                SHUTDOWN_GRACE
            ),
        }

        if aggregator.is_empty() {
            tracing::warn!("Session: no results were recorded");
        } else {
            tracing::info!("Session stopped, {} results recorded", aggregator.len());
        }
        let snapshot = aggregator.snapshot(TimeWindow::new(started_at, ended_at));

        let metadata = RunMetadata {
            started_at,
            ended_at,
            planned_duration_secs: self.config.duration.as_secs(),
            interval_secs: self.config.interval.as_secs(),
            ping_interval_secs: self.config.ping_interval.as_secs(),
            targets: self.config.targets.iter().map(|t| t.address.clone()).collect(),
            ports: self.config.ports.clone(),
            local_address: self.resolver.resolve(),
            thresholds: self.config.thresholds,
        };
        let report = report::render(&snapshot, &metadata);

        if let (Some(text), Some(json)) = (&outputs.summary_text, &outputs.summary_json) {
            report::write_summary(text, json, &report, &snapshot, &metadata)?;
            tracing::info!("Summary written to {}", text.display());
        }

        Ok(SessionOutcome {
            snapshot,
            metadata,
            report,
        })
    }
}
