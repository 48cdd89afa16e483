//! Process-backed probe runner.
//!
//! Runs the external diagnostic binaries and hands their combined output back
//! for extraction. Timeouts are enforced by the caller; dropping the future
//! kills the child.

use super::{Invocation, ProbeError, ProbeKind, ProbeRunner, RawOutput};

use async_trait::async_trait;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Binaries without which a run cannot start.
pub const REQUIRED_PROGRAMS: [&str; 2] = ["ping", "nc"];

/// Runs probes as child processes.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProbeRunner for CommandRunner {
    async fn run(&self, invocation: &Invocation) -> Result<RawOutput, ProbeError> {
        tracing::debug!("Running {} {}", invocation.program, invocation.args.join(" "));

        let output = Command::new(invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProbeError::Execution(format!("failed to execute {}: {}", invocation.program, e))
            })?;

        // tcpdump and nc report on stderr
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        Ok(RawOutput {
            text,
            exit_code: output.status.code(),
        })
    }
}

/// Programs that could not be found on `PATH`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityReport {
    pub missing_required: Vec<&'static str>,
    pub missing_optional: Vec<&'static str>,
}

impl CapabilityReport {
    pub fn is_usable(&self) -> bool {
        self.missing_required.is_empty()
    }
}

/// Check that every probe binary is installed.
pub fn check_capabilities() -> CapabilityReport {
    let path = env::var_os("PATH").unwrap_or_default();
    let dirs: Vec<PathBuf> = env::split_paths(&path).collect();
    check_capabilities_in(&dirs)
}

fn check_capabilities_in(dirs: &[PathBuf]) -> CapabilityReport {
    let mut report = CapabilityReport::default();
    for kind in ProbeKind::all() {
        let program = kind.program();
        if dirs.iter().any(|dir| is_executable(&dir.join(program))) {
            continue;
        }
        if REQUIRED_PROGRAMS.contains(&program) {
            report.missing_required.push(program);
        } else {
            report.missing_optional.push(program);
        }
    }
    report
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
