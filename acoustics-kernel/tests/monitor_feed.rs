use acoustics_devkit::{wait_until, wait_until_async, MockMonitorServer, MonitorMessageBuilder, TestHarness};
use acoustics_kernel::audit::AuditTrail;
use acoustics_kernel::models::{DiagnosticSeverity, SendStatus, Severity};
use acoustics_kernel::monitor::ConnectionState;
use acoustics_kernel::{BroadcastHub, DeviceStore, LogStores, MonitorClient};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    harness: TestHarness,
    server: MockMonitorServer,
    devices: Arc<DeviceStore>,
    logs: LogStores,
    hub: BroadcastHub,
    client: Arc<MonitorClient>,
}

async fn fixture() -> Fixture {
    let harness = TestHarness::new().unwrap();
    let server = MockMonitorServer::start().await.unwrap();
    let devices = Arc::new(DeviceStore::new(harness.devices_path()));
    let logs = LogStores::new();
    let hub = BroadcastHub::new();
    let client = Arc::new(MonitorClient::new(
        Some(server.url()),
        Arc::clone(&devices),
        logs.clone(),
        hub.clone(),
        AuditTrail::new(harness.audit_path()),
    ));
    Fixture {
        harness,
        server,
        devices,
        logs,
        hub,
        client,
    }
}

#[tokio::test]
async fn test_feed_messages_reach_stores_and_subscribers() {
    let f = fixture().await;
    let mut subscription = f.hub.subscribe();
    let task = f.client.start().unwrap();
    assert!(f.server.wait_for_accepted(1, Duration::from_secs(5)).await);

    f.server.push(&MonitorMessageBuilder::hello());
    f.server.push(&MonitorMessageBuilder::heartbeat("dev-01", 20.0));
    f.server.push(&MonitorMessageBuilder::diagnostics("dev-01", "buffer underrun", "critical"));
    f.server.push(&MonitorMessageBuilder::sendlog("req-7", "dev-01", "chime", "failed"));
    f.server.push(&MonitorMessageBuilder::reject("dev-02", "stale command"));
    f.server.push_raw("definitely not json");

    assert!(wait_until(Duration::from_secs(5), || f.logs.receivelog.lock().len() == 2).await);
    assert!(wait_until(Duration::from_secs(5), || f.logs.sendlog.lock().len() == 1).await);

    let device = f.devices.get("dev-01").unwrap();
    assert_eq!(device.status, Severity::Ok);
    assert_eq!(device.latency_mean_ms, Some(20.0));
    assert!(f.devices.get("dev-02").is_none());

    let diagnostics = f.logs.diagnostics.lock().to_vec();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].severity, DiagnosticSeverity::Critical);
    assert_eq!(f.logs.sendlog.lock().to_vec()[0].status, SendStatus::Failed);

    let mut kinds = Vec::new();
    while let Some(text) = subscription.try_recv() {
        let push: serde_json::Value = serde_json::from_str(&text).unwrap();
        kinds.push(push["type"].as_str().unwrap().to_string());
    }
    assert_eq!(kinds, vec!["receivelog", "diagnostics", "sendlog", "receivelog"]);

    // the sendlog audit record is written from an async task
    let audit_path = f.harness.audit_path();
    assert!(
        wait_until_async(Duration::from_secs(2), || {
            let audit_path = audit_path.clone();
            async move {
                tokio::fs::read_to_string(&audit_path)
                    .await
                    .map(|raw| raw.ends_with('\n') && raw.lines().count() == 1)
                    .unwrap_or(false)
            }
        })
        .await
    );
    let records = f.harness.read_jsonl(&audit_path).unwrap();
    assert_eq!(records[0]["type"], "sendlog");

    f.client.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(f.client.connection().state(), ConnectionState::Disconnected);
    assert!(wait_until(Duration::from_secs(2), || f.server.open_connections() == 0).await);
}

#[tokio::test]
async fn test_client_reconnects_after_drop() {
    let f = fixture().await;
    let task = f.client.start().unwrap();
    assert!(f.server.wait_for_accepted(1, Duration::from_secs(5)).await);
    assert!(wait_until(Duration::from_secs(2), || f.client.connection().state() == ConnectionState::Connected).await);

    assert_eq!(f.server.open_connections(), 1);
    f.server.drop_connections();
    assert!(wait_until(Duration::from_secs(2), || f.client.connection().state() != ConnectionState::Connected).await);
    assert!(wait_until(Duration::from_secs(2), || f.server.open_connections() == 0).await);

    // reconnect delay is at most 10 s
    assert!(f.server.wait_for_accepted(2, Duration::from_secs(15)).await);
    assert!(f.client.connection().reconnects() >= 1);

    f.server.push(&MonitorMessageBuilder::heartbeat("dev-03", 80.0));
    assert!(wait_until(Duration::from_secs(5), || f.devices.get("dev-03").is_some()).await);
    assert_eq!(f.devices.get("dev-03").unwrap().status, Severity::Warning);

    f.client.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_during_backoff_ends_loop() {
    let harness = TestHarness::new().unwrap();
    let client = Arc::new(MonitorClient::new(
        // nothing listens on port 1
        Some("ws://127.0.0.1:1".into()),
        Arc::new(DeviceStore::new(harness.devices_path())),
        LogStores::new(),
        BroadcastHub::new(),
        AuditTrail::new(harness.audit_path()),
    ));
    let task = client.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.stop();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(client.connection().state(), ConnectionState::Disconnected);
}
