use crate::devices::DeviceStore;
use crate::hub::BroadcastHub;
use crate::monitor::{ConnectionManager, ConnectionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub devices_tracked: u32,
    pub subscribers: u32,
    pub memory_usage_mb: f32,
    pub monitor_status: ConnectionState,
    pub monitor_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    devices: Arc<DeviceStore>,
    hub: BroadcastHub,
    connection: ConnectionManager,
}

impl HealthTracker {
    pub fn new(devices: Arc<DeviceStore>, hub: BroadcastHub, connection: ConnectionManager) -> Self {
        Self {
            start_time: Instant::now(),
            devices,
            hub,
            connection,
        }
    }

    pub fn get_health(&self) -> KernelHealth {
        KernelHealth {
            status: "ok".to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_tracked: self.devices.len() as u32,
            subscribers: self.hub.subscriber_count() as u32,
            memory_usage_mb: get_memory_usage_mb(),
            monitor_status: self.connection.state(),
            monitor_reconnects: self.connection.reconnects(),
        }
    }

    /// Periodic health line in the kernel log.
    pub fn spawn_health_logger(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let health = tracker.get_health();
                info!(
                    uptime_seconds = health.uptime_seconds,
                    devices = health.devices_tracked,
                    subscribers = health.subscribers,
                    monitor = ?health.monitor_status,
                    reconnects = health.monitor_reconnects,
                    "kernel health"
                );
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::HeartbeatUpdate;

    #[test]
    fn test_health_reflects_components() {
        let devices = Arc::new(DeviceStore::new("unused.json"));
        let hub = BroadcastHub::new();
        let connection = ConnectionManager::new();
        let tracker = HealthTracker::new(Arc::clone(&devices), hub.clone(), connection.clone());

        devices.apply_heartbeat(HeartbeatUpdate {
            device_id: "dev-01".into(),
            ..Default::default()
        });
        let _sub = hub.subscribe();
        connection.mark_connected();
        connection.increment_reconnects();

        let health = tracker.get_health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.devices_tracked, 1);
        assert_eq!(health.subscribers, 1);
        assert_eq!(health.monitor_status, ConnectionState::Connected);
        assert_eq!(health.monitor_reconnects, 1);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["monitor_status"], "connected");
    }
}
