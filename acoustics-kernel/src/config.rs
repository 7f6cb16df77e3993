use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub devices_path: PathBuf,
    pub devices_poll_interval_ms: u64,
    pub audit_log_path: PathBuf,
    pub scheduler_binary: PathBuf,
    pub osc_config_path: PathBuf,
    /// `None` disables the monitor feed.
    pub monitor_ws_url: Option<String>,
    pub default_send: SendConf,
    pub dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SendConf {
    pub host: String,
    pub port: u16,
    pub lead_time_seconds: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http: HttpConf {
                host: "127.0.0.1".into(),
                port: 48090,
            },
            devices_path: "state/devices.json".into(),
            devices_poll_interval_ms: 1_000,
            audit_log_path: "logs/gui_audit.jsonl".into(),
            scheduler_binary: "build/scheduler/agent_a_scheduler".into(),
            osc_config_path: "acoustics/secrets/osc_config.json".into(),
            monitor_ws_url: Some("ws://127.0.0.1:48080/ws/events".into()),
            default_send: SendConf {
                host: "255.255.255.255".into(),
                port: 9000,
                lead_time_seconds: 4.0,
            },
            dry_run: true,
        }
    }
}

impl KernelConfig {
    pub fn parse_yaml(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }

    /// Environment overrides applied on top of the file.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ACOUSTICS_MONITOR_URL") {
            self.monitor_ws_url = if url.trim().is_empty() { None } else { Some(url) };
        }
        if let Ok(flag) = std::env::var("ACOUSTICS_DRY_RUN") {
            self.dry_run = matches!(flag.trim(), "1" | "true" | "yes");
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("ACOUSTICS_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut config = load_config_from(Path::new(&path)).await;
    config.apply_env();
    config
}

pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!("no {}, using default configuration", path.display());
        return KernelConfig::default();
    }

    let txt = fs::read_to_string(path).await.unwrap_or_default();
    match KernelConfig::parse_yaml(&txt) {
        Ok(config) => {
            info!("configuration loaded from {}", path.display());
            config
        }
        Err(e) => {
            warn!("invalid configuration {}: {}", path.display(), e);
            KernelConfig::default()
        }
    }
}
