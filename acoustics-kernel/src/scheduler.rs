//! External scheduler invocation
//!
//! The scheduler binary owns network delivery. This module only writes its
//! input artifact, builds the argv contract and runs the process to completion:
//!
//! `<artifact> --host H --port P --lead-time L --base-time T --osc-config C [--dry-run]`

use crate::config::KernelConfig;
use crate::models::format_iso;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler binary not found: {0}")]
    BinaryMissing(PathBuf),
    #[error("Failed to write artifact: {0}")]
    Artifact(#[source] std::io::Error),
    #[error("Failed to serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to spawn scheduler: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Scheduler exited with {0}")]
    Exit(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub binary: PathBuf,
    pub host: String,
    pub port: u16,
    pub osc_config: PathBuf,
    pub dry_run: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            binary: config.scheduler_binary.clone(),
            host: config.default_send.host.clone(),
            port: config.default_send.port,
            osc_config: config.osc_config_path.clone(),
            dry_run: config.dry_run,
        }
    }

    pub fn binary_exists(&self) -> bool {
        self.binary.is_file()
    }

    pub fn build_args(&self, artifact: &Path, lead_time_seconds: f64, base_time: OffsetDateTime) -> Vec<String> {
        let mut args = vec![
            artifact.display().to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--lead-time".to_string(),
            format_seconds(lead_time_seconds),
            "--base-time".to_string(),
            format_iso(base_time),
            "--osc-config".to_string(),
            self.osc_config.display().to_string(),
        ];
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args
    }
}

/// `3` rather than `3.0`, `4.5` stays `4.5`.
fn format_seconds(seconds: f64) -> String {
    // f64 Display already drops a zero fraction
    seconds.to_string()
}

/// Result of one scheduler run.
#[derive(Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

/// Writes the artifact into a fresh `timeline-*` temp dir. The directory is
/// removed when the returned guard drops.
pub async fn write_artifact<T: serde::Serialize>(
    name: &str,
    artifact: &T,
) -> Result<(tempfile::TempDir, PathBuf), SchedulerError> {
    let json = serde_json::to_string_pretty(artifact)?;
    let dir = tempfile::Builder::new()
        .prefix("timeline-")
        .tempdir()
        .map_err(SchedulerError::Artifact)?;
    let path = dir.path().join(format!("{}.json", sanitize_file_stem(name)));
    tokio::fs::write(&path, json)
        .await
        .map_err(SchedulerError::Artifact)?;
    Ok((dir, path))
}

fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "timeline".to_string()
    } else {
        stem
    }
}

/// Runs the scheduler and waits for it. Output lines are re-emitted under the
/// `scheduler` log target.
pub async fn run(binary: &Path, args: &[String]) -> Result<ExecutionResult, SchedulerError> {
    let start = Instant::now();
    debug!("spawning {} {:?}", binary.display(), args);

    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(SchedulerError::Spawn)?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!(target: "scheduler", "{}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        warn!(target: "scheduler", "{}", line);
    }

    let result = ExecutionResult {
        success: output.status.success(),
        exit_code: output.status.code(),
        execution_time_ms: start.elapsed().as_millis(),
    };
    if result.success {
        Ok(result)
    } else {
        Err(SchedulerError::Exit(output.status.to_string()))
    }
}
