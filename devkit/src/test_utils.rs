/*!
Test harness for kernel integration tests

- Scratch directory with devices file, audit trail and osc config paths
- Fake scheduler scripts that record their argv and exit with a chosen code
- Polling helper for asynchronous outcomes
*/

use anyhow::{Context, Result};
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub struct TestHarness {
    dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::Builder::new()
            .prefix("acoustics-test-")
            .tempdir()
            .context("failed to create harness dir")?;
        log::debug!("harness dir {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn devices_path(&self) -> PathBuf {
        self.path().join("devices.json")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.path().join("logs").join("audit.jsonl")
    }

    pub fn osc_config_path(&self) -> PathBuf {
        self.path().join("osc_config.json")
    }

    pub fn args_path(&self) -> PathBuf {
        self.path().join("scheduler_args.txt")
    }

    pub fn artifact_copy_path(&self) -> PathBuf {
        self.path().join("last_artifact.json")
    }

    pub fn write_devices(&self, devices: &Value) -> Result<PathBuf> {
        let path = self.devices_path();
        std::fs::write(&path, serde_json::to_vec_pretty(devices)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Shell script standing in for the scheduler. It copies its artifact
    /// (first argument) next to the harness files, writes one argument per
    /// line to `scheduler_args.txt` and exits with `exit_code`.
    #[cfg(unix)]
    pub fn fake_scheduler(&self, exit_code: i32) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.path().join(format!("fake_scheduler_{}", exit_code));
        let script = format!(
            "#!/bin/sh\ncp \"$1\" '{artifact}'\nprintf '%s\\n' \"$@\" > '{args}'\necho \"fake scheduler: $# args\"\nexit {code}\n",
            artifact = self.artifact_copy_path().display(),
            args = self.args_path().display(),
            code = exit_code,
        );
        std::fs::write(&path, script).context("failed to write fake scheduler")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    pub fn recorded_args(&self) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(self.args_path()).context("scheduler did not record args")?;
        Ok(raw.lines().map(str::to_string).collect())
    }

    pub fn recorded_artifact(&self) -> Result<Value> {
        let raw = std::fs::read_to_string(self.artifact_copy_path()).context("scheduler did not copy artifact")?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Parsed JSON lines; a missing file reads as empty.
    pub fn read_jsonl(&self, path: &Path) -> Result<Vec<Value>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        std::fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("invalid audit line"))
            .collect()
    }
}

/// Polls `condition` every 20 ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let met = condition();
    if !met {
        log::warn!("condition not met after {:?}", timeout);
    }
    met
}

/// Async flavour of [`wait_until`].
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_in_harness_dir() {
        let harness = TestHarness::new().unwrap();
        assert!(harness.devices_path().starts_with(harness.path()));
        assert!(harness.audit_path().starts_with(harness.path()));
    }

    #[test]
    fn test_read_jsonl_missing_is_empty() {
        let harness = TestHarness::new().unwrap();
        assert!(harness.read_jsonl(&harness.audit_path()).unwrap().is_empty());

        let path = harness.path().join("x.jsonl");
        std::fs::write(&path, "{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        assert_eq!(harness.read_jsonl(&path).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_until() {
        let start = Instant::now();
        assert!(wait_until(Duration::from_secs(1), || start.elapsed() > Duration::from_millis(50)).await);
        assert!(!wait_until(Duration::from_millis(60), || false).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fake_scheduler_records_args() {
        let harness = TestHarness::new().unwrap();
        let script = harness.fake_scheduler(3).unwrap();
        let artifact = harness.path().join("in.json");
        std::fs::write(&artifact, "{\"version\":\"1.2\"}").unwrap();

        let status = tokio::process::Command::new(&script)
            .arg(&artifact)
            .arg("--dry-run")
            .status()
            .await
            .unwrap();

        assert_eq!(status.code(), Some(3));
        assert_eq!(harness.recorded_args().unwrap()[1], "--dry-run");
        assert_eq!(harness.recorded_artifact().unwrap()["version"], "1.2");
    }
}
