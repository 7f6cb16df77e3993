/**
 * MONITOR CLIENT - Reconnecting consumer of the device monitor feed
 *
 * ROLE :
 * Holds one WebSocket connection to the monitor service, normalizes each
 * message and routes it to the device store, the bounded logs, the audit
 * trail and the broadcast hub.
 *
 * LIFECYCLE :
 * connecting -> connected -> disconnected -> (delay) -> connecting ...
 * Delay = min(10 s, 1 s + random jitter in [0, 10 s)). `stop()` ends the loop
 * and closes the open socket.
 */

use crate::audit::{AuditRecord, AuditTrail};
use crate::devices::DeviceStore;
use crate::hub::BroadcastHub;
use crate::inbound::InboundMessage;
use crate::log_store::LogStores;
use crate::models::Push;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 10_000;

pub fn reconnect_delay(jitter_ms: u64) -> Duration {
    Duration::from_millis(RECONNECT_MAX_MS.min(RECONNECT_BASE_MS + jitter_ms))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Connection state plus reconnect counter, shared with the health report.
#[derive(Clone)]
pub struct ConnectionManager {
    state: Arc<Mutex<ConnectionState>>,
    reconnects: Arc<AtomicU32>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            reconnects: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn mark_connecting(&self) {
        *self.state.lock() = ConnectionState::Connecting;
    }

    pub fn mark_connected(&self) {
        *self.state.lock() = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MonitorClient {
    url: Option<String>,
    devices: Arc<DeviceStore>,
    logs: LogStores,
    hub: BroadcastHub,
    audit: AuditTrail,
    connection: ConnectionManager,
    shutdown: watch::Sender<bool>,
}

impl MonitorClient {
    pub fn new(
        url: Option<String>,
        devices: Arc<DeviceStore>,
        logs: LogStores,
        hub: BroadcastHub,
        audit: AuditTrail,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            url,
            devices,
            logs,
            hub,
            audit,
            connection: ConnectionManager::new(),
            shutdown,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Spawns the connection loop. Returns `None` when no URL is configured.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let Some(url) = self.url.clone() else {
            warn!("monitor_ws_url not configured; monitor client not started");
            return None;
        };
        let client = Arc::clone(self);
        Some(tokio::spawn(async move { client.run(url).await }))
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(&self, url: String) {
        let mut shutdown = self.shutdown.subscribe();

        while !self.stopped() {
            self.connection.mark_connecting();
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((mut socket, _)) => {
                    self.connection.mark_connected();
                    info!("monitor connected -> {}", url);

                    loop {
                        tokio::select! {
                            frame = socket.next() => match frame {
                                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                                Some(Ok(Message::Close(frame))) => {
                                    debug!("monitor closed the connection: {:?}", frame);
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("monitor connection error: {}", e);
                                    break;
                                }
                                None => break,
                            },
                            _ = shutdown.changed() => {
                                let _ = socket.close(None).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("monitor connection to {} failed: {}", url, e),
            }

            self.connection.mark_disconnected();
            if self.stopped() {
                break;
            }

            let delay = reconnect_delay(rand::rng().random_range(0..RECONNECT_MAX_MS));
            warn!("monitor disconnected, reconnecting in {} ms", delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => self.connection.increment_reconnects(),
                _ = shutdown.changed() => break,
            }
        }
        info!("monitor client stopped");
    }

    /// Routes one raw feed message. Unparsable messages are logged and dropped.
    pub async fn handle_text(&self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => warn!("dropping monitor message: {}", e),
        }
    }

    pub async fn handle(&self, message: InboundMessage) {
        match message {
            InboundMessage::Heartbeat { update, entry } => {
                self.devices.apply_heartbeat(update);
                self.logs.receivelog.lock().push(entry.clone());
                self.hub.broadcast(&Push::Receivelog { entry });
            }
            InboundMessage::Diagnostics(entry) => {
                self.logs.diagnostics.lock().push(entry.clone());
                self.hub.broadcast(&Push::Diagnostics { entry });
            }
            InboundMessage::Sendlog(entry) => {
                self.logs.sendlog.lock().push(entry.clone());
                self.hub.broadcast(&Push::Sendlog { entry: entry.clone() });
                self.audit.record(AuditRecord::sendlog(entry)).await;
            }
            InboundMessage::Received(entry) => {
                self.logs.receivelog.lock().push(entry.clone());
                self.hub.broadcast(&Push::Receivelog { entry });
            }
            InboundMessage::Hello => debug!("monitor hello"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(dir: &std::path::Path) -> (MonitorClient, BroadcastHub) {
        let hub = BroadcastHub::new();
        let client = MonitorClient::new(
            None,
            Arc::new(DeviceStore::new(dir.join("devices.json"))),
            LogStores::new(),
            hub.clone(),
            AuditTrail::new(dir.join("audit.jsonl")),
        );
        (client, hub)
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(1_000));
        assert_eq!(reconnect_delay(4_500), Duration::from_millis(5_500));
        assert_eq!(reconnect_delay(9_999), Duration::from_millis(10_000));
    }

    #[test]
    fn test_connection_manager_transitions() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.mark_connecting();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.mark_connected();
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.increment_reconnects();
        manager.increment_reconnects();
        assert_eq!(manager.reconnects(), 2);
    }

    #[tokio::test]
    async fn test_start_without_url_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client(dir.path());
        assert!(Arc::new(client).start().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_updates_store_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let (client, hub) = client(dir.path());
        let mut sub = hub.subscribe();

        client
            .handle_text(r#"{"type":"heartbeat","device_id":"dev-01","latency_ms":20}"#)
            .await;

        let device = client.devices.get("dev-01").unwrap();
        assert_eq!(device.latency_mean_ms, Some(20.0));
        assert_eq!(client.logs.receivelog.lock().len(), 1);

        let pushed: serde_json::Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(pushed["type"], "receivelog");
        assert_eq!(pushed["entry"]["type"], "heartbeat");
    }

    #[tokio::test]
    async fn test_sendlog_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client(dir.path());

        client
            .handle_text(r#"{"type":"sendlog","request_id":"r1","device_id":"dev-01","status":"failed"}"#)
            .await;

        assert_eq!(client.logs.sendlog.lock().len(), 1);
        let audit = tokio::fs::read_to_string(dir.path().join("audit.jsonl")).await.unwrap();
        let record: serde_json::Value = serde_json::from_str(audit.trim()).unwrap();
        assert_eq!(record["type"], "sendlog");
        assert_eq!(record["entry"]["request_id"], "r1");
    }

    #[tokio::test]
    async fn test_reject_and_garbage_leave_devices_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (client, hub) = client(dir.path());
        let mut sub = hub.subscribe();

        client.handle_text(r#"{"type":"reject","device_id":"dev-09"}"#).await;
        client.handle_text("{{{").await;
        client.handle_text(r#"{"type":"hello"}"#).await;

        assert!(client.devices.is_empty());
        assert_eq!(client.logs.receivelog.lock().len(), 1);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }
}
