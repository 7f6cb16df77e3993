use acoustics_devkit::{wait_until, TestHarness};
use acoustics_kernel::audit::AuditTrail;
use acoustics_kernel::health::HealthTracker;
use acoustics_kernel::http::{build_router, AppState};
use acoustics_kernel::models::Push;
use acoustics_kernel::monitor::ConnectionManager;
use acoustics_kernel::scheduler::SchedulerSettings;
use acoustics_kernel::{BroadcastHub, DeviceStore, LogStores, TimelineService};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn serve(harness: &TestHarness, hub: BroadcastHub) -> String {
    let devices = Arc::new(DeviceStore::new(harness.devices_path()));
    let state = AppState {
        health: HealthTracker::new(Arc::clone(&devices), hub.clone(), ConnectionManager::new()),
        devices,
        logs: LogStores::new(),
        timeline: TimelineService::new(
            SchedulerSettings {
                binary: harness.path().join("absent"),
                host: "127.0.0.1".into(),
                port: 9000,
                osc_config: harness.osc_config_path(),
                dry_run: true,
            },
            AuditTrail::new(harness.audit_path()),
        ),
        hub,
        default_lead_time_seconds: 4.0,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("ws://{}/ws", addr)
}

#[tokio::test]
async fn test_live_socket_receives_broadcasts() {
    let harness = TestHarness::new().unwrap();
    let hub = BroadcastHub::new();
    let url = serve(&harness, hub.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || hub.subscriber_count() == 1).await);

    hub.broadcast(&Push::Ntp {
        now_utc: "2025-06-01T20:00:00Z".into(),
    });

    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected text frame, got {:?}", frame);
    };
    let push: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(push["type"], "ntp");
    assert_eq!(push["now_utc"], "2025-06-01T20:00:00Z");

    drop(socket);
    assert!(wait_until(Duration::from_secs(2), || hub.subscriber_count() == 0).await);
}

#[tokio::test]
async fn test_close_all_ends_live_sockets() {
    let harness = TestHarness::new().unwrap();
    let hub = BroadcastHub::new();
    let url = serve(&harness, hub.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || hub.subscriber_count() == 1).await);

    hub.close_all();
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
