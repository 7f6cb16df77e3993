/**
 * DEVICE STORE - Authoritative health view of the playback fleet
 *
 * ROLE :
 * Owns the device_id -> DeviceSnapshot map. Live heartbeats (from the monitor
 * feed), administrative overrides and the periodic devices.json snapshot are
 * all merged here, and every merge republishes the full, id-ordered list.
 *
 * OPERATION :
 * - Partial merges only: a field missing from an update keeps its value
 * - Severity is recomputed from the merged heartbeat timestamp + mean latency
 * - devices.json is polled for changes (mtime + length) and re-reconciled
 * - Disk and parse failures are logged, prior state is kept
 */

use crate::models::{format_iso, parse_iso, DevicePatch, DeviceSnapshot, Severity};
use crate::state::{new_state, Notifier, Shared};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HEARTBEAT_WARNING_MS: i64 = 3_000;
const HEARTBEAT_CRITICAL_MS: i64 = 10_000;
const LATENCY_WARNING_MS: f64 = 50.0;
const LATENCY_CRITICAL_MS: f64 = 150.0;

#[derive(Debug, thiserror::Error)]
pub enum DeviceStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid devices file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classifies a device. Heartbeat age always wins over latency.
pub fn classify_severity(
    last_heartbeat: Option<&str>,
    latency_mean_ms: Option<f64>,
    now: OffsetDateTime,
) -> Severity {
    let Some(last) = last_heartbeat.and_then(parse_iso) else {
        return Severity::Offline;
    };

    let age_ms = (now - last).whole_milliseconds();
    if age_ms > HEARTBEAT_CRITICAL_MS as i128 {
        return Severity::Critical;
    }
    if age_ms > HEARTBEAT_WARNING_MS as i128 {
        return Severity::Warning;
    }

    match latency_mean_ms {
        Some(latency) if latency > LATENCY_CRITICAL_MS => Severity::Critical,
        Some(latency) if latency > LATENCY_WARNING_MS => Severity::Warning,
        _ => Severity::Ok,
    }
}

/// Live heartbeat as seen by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatUpdate {
    pub device_id: String,
    pub latency_ms: Option<f64>,
    pub timestamp: Option<String>,
    pub queue_depth: Option<u32>,
    pub is_playing: Option<bool>,
}

// Entry shape written by the fleet tools; several field spellings coexist.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDevice {
    #[serde(alias = "id")]
    device_id: Option<String>,
    alias: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    #[serde(alias = "last_seen")]
    last_heartbeat: Option<String>,
    heartbeat: Option<RawHeartbeatStats>,
    latency_mean_ms: Option<f64>,
    latency_p99_ms: Option<f64>,
    ntp_offset_ms: Option<f64>,
    tags: Option<Vec<String>>,
    rssi: Option<f64>,
    battery_pct: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawHeartbeatStats {
    mean_ms: Option<f64>,
    latency_mean_ms: Option<f64>,
    latency_max_ms: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDevicesFile {
    List(Vec<serde_json::Value>),
    Wrapped {
        #[serde(default)]
        devices: Vec<serde_json::Value>,
    },
}

impl RawDevice {
    fn into_patch(self) -> Option<(String, DevicePatch)> {
        let device_id = self.device_id.filter(|id| !id.is_empty())?;
        let stats = self.heartbeat.unwrap_or_default();
        let patch = DevicePatch {
            alias: self.alias,
            ip: self.ip,
            port: self.port,
            last_heartbeat: self.last_heartbeat,
            latency_mean_ms: self
                .latency_mean_ms
                .or(stats.mean_ms)
                .or(stats.latency_mean_ms),
            latency_max_ms: self.latency_p99_ms.or(stats.latency_max_ms),
            ntp_offset_ms: self.ntp_offset_ms,
            tags: self.tags,
            rssi: self.rssi,
            battery_pct: self.battery_pct,
            ..Default::default()
        };
        Some((device_id, patch))
    }
}

/// Parses a devices file: a bare array or `{ "devices": [...] }`.
/// Entries that are not objects or carry no id are skipped.
fn parse_devices_file(raw: &str) -> Result<Vec<(String, DevicePatch)>, DeviceStoreError> {
    let entries = match serde_json::from_str::<RawDevicesFile>(raw)? {
        RawDevicesFile::List(list) => list,
        RawDevicesFile::Wrapped { devices } => devices,
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<RawDevice>(entry) {
            Ok(device) => device.into_patch(),
            Err(e) => {
                debug!("skipping devices.json entry: {}", e);
                None
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

pub struct DeviceStore {
    devices: Shared<BTreeMap<String, DeviceSnapshot>>,
    devices_path: PathBuf,
    notifier: Notifier<Vec<DeviceSnapshot>>,
}

impl DeviceStore {
    pub fn new(devices_path: impl Into<PathBuf>) -> Self {
        Self {
            devices: new_state(BTreeMap::new()),
            devices_path: devices_path.into(),
            notifier: Notifier::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.devices_path
    }

    /// Change notifications; each carries the full snapshot list.
    pub fn notifier(&self) -> &Notifier<Vec<DeviceSnapshot>> {
        &self.notifier
    }

    /// All snapshots ordered by device id.
    pub fn all(&self) -> Vec<DeviceSnapshot> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn apply_heartbeat(&self, update: HeartbeatUpdate) {
        self.apply_heartbeat_at(update, OffsetDateTime::now_utc());
    }

    pub fn apply_heartbeat_at(&self, update: HeartbeatUpdate, now: OffsetDateTime) {
        let snapshot = self.notifier.publish_after(|| {
            let mut devices = self.devices.lock();
            let entry = devices
                .entry(update.device_id.clone())
                .or_insert_with(|| DeviceSnapshot::new(update.device_id.clone(), Severity::Offline, now));

            let previous_max = entry.latency_max_ms;
            DevicePatch {
                last_heartbeat: Some(
                    update
                        .timestamp
                        .unwrap_or_else(|| format_iso(now)),
                ),
                latency_mean_ms: update.latency_ms,
                latency_max_ms: match (update.latency_ms, previous_max) {
                    (Some(latency), Some(max)) => Some(latency.max(max)),
                    (Some(latency), None) => Some(latency),
                    (None, max) => max,
                },
                queue_depth: update.queue_depth,
                is_playing: update.is_playing,
                ..Default::default()
            }
            .apply_to(entry);

            entry.status = classify_severity(entry.last_heartbeat.as_deref(), entry.latency_mean_ms, now);
            entry.last_updated = now;
            let snapshot = entry.clone();
            (snapshot, devices.values().cloned().collect())
        });

        debug!(
            device_id = %snapshot.device_id,
            status = ?snapshot.status,
            "heartbeat applied"
        );
    }

    /// Administrative merge that bypasses heartbeat logic. Unseen devices are
    /// created as `offline`.
    pub fn apply_baseline_override(&self, device_id: &str, patch: DevicePatch) {
        self.notifier.publish_after(|| {
            let mut devices = self.devices.lock();
            match devices.get_mut(device_id) {
                Some(existing) => patch.apply_to(existing),
                None => {
                    let mut snapshot =
                        DeviceSnapshot::new(device_id, Severity::Offline, OffsetDateTime::now_utc());
                    patch.apply_to(&mut snapshot);
                    devices.insert(device_id.to_string(), snapshot);
                }
            }
            ((), devices.values().cloned().collect())
        });
    }

    /// Merges a batch of disk entries and publishes once.
    pub fn reconcile(&self, entries: Vec<(String, DevicePatch)>, now: OffsetDateTime) {
        self.notifier.publish_after(|| {
            let mut devices = self.devices.lock();
            for (device_id, patch) in entries {
                let entry = devices
                    .entry(device_id.clone())
                    .or_insert_with(|| DeviceSnapshot::new(device_id, Severity::Offline, now));
                patch.apply_to(entry);
                entry.status = classify_severity(entry.last_heartbeat.as_deref(), entry.latency_mean_ms, now);
                entry.last_updated = now;
            }
            ((), devices.values().cloned().collect())
        });
    }

    /// Reads the devices file and reconciles it. Missing or empty files are
    /// not an error; malformed files leave the current state untouched.
    pub async fn reload_from_disk(&self) -> Result<usize, DeviceStoreError> {
        let raw = match tokio::fs::read_to_string(&self.devices_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(0);
        }

        let entries = parse_devices_file(&raw)?;
        let count = entries.len();
        self.reconcile(entries, OffsetDateTime::now_utc());
        Ok(count)
    }

    async fn reload_logged(&self) {
        match self.reload_from_disk().await {
            Ok(count) if count > 0 => {
                info!("loaded {} devices from {}", count, self.devices_path.display());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("failed to load devices from {}: {}", self.devices_path.display(), e);
            }
        }
    }

    /// Initial load, then a background task that reloads whenever the file
    /// changes. The task runs until aborted.
    pub async fn load_and_watch(self: &Arc<Self>, poll_interval: Duration) -> JoinHandle<()> {
        self.reload_logged().await;

        let store = Arc::clone(self);
        let mut last_stamp = store.file_stamp().await;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                let stamp = store.file_stamp().await;
                if stamp != last_stamp {
                    last_stamp = stamp;
                    if stamp.is_some() {
                        debug!("devices file changed, reloading");
                        store.reload_logged().await;
                    }
                }
            }
        })
    }

    async fn file_stamp(&self) -> Option<FileStamp> {
        let meta = tokio::fs::metadata(&self.devices_path).await.ok()?;
        Some(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}
