/**
 * ACOUSTICS KERNEL - Main entry point
 *
 * ROLE : Wires configuration, device store, monitor feed, timeline service,
 * broadcast hub and the HTTP/WebSocket server, then runs until Ctrl-C.
 */

use acoustics_kernel::audit::AuditTrail;
use acoustics_kernel::config::load_config;
use acoustics_kernel::health::HealthTracker;
use acoustics_kernel::http::{self, AppState};
use acoustics_kernel::models::{now_iso, Push};
use acoustics_kernel::scheduler::SchedulerSettings;
use acoustics_kernel::{BroadcastHub, DeviceStore, LogStores, MonitorClient, TimelineService};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const NTP_TICK: Duration = Duration::from_secs(1);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("acoustics_kernel=info,scheduler=info")),
        )
        .init();

    let config = load_config().await;
    let hub = BroadcastHub::new();
    let logs = LogStores::new();
    let audit = AuditTrail::new(&config.audit_log_path);

    // devices: initial load + file watcher
    let devices = Arc::new(DeviceStore::new(&config.devices_path));
    {
        let hub = hub.clone();
        devices
            .notifier()
            .subscribe(move |snapshot| {
                hub.broadcast(&Push::Devices {
                    devices: snapshot.clone(),
                });
            });
    }
    let watcher = devices
        .load_and_watch(Duration::from_millis(config.devices_poll_interval_ms))
        .await;

    // timeline
    let timeline = TimelineService::new(SchedulerSettings::from_config(&config), audit.clone());
    {
        let hub = hub.clone();
        timeline.notifier().subscribe(move |events| {
            hub.broadcast(&Push::Timeline {
                events: events.clone(),
            });
        });
    }

    // monitor feed
    let monitor = Arc::new(MonitorClient::new(
        config.monitor_ws_url.clone(),
        Arc::clone(&devices),
        logs.clone(),
        hub.clone(),
        audit,
    ));
    let monitor_task = monitor.start();

    let ntp = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(NTP_TICK);
            loop {
                interval.tick().await;
                hub.broadcast(&Push::Ntp { now_utc: now_iso() });
            }
        })
    };

    let health = HealthTracker::new(Arc::clone(&devices), hub.clone(), monitor.connection().clone());
    let health_logger = health.spawn_health_logger(HEALTH_LOG_INTERVAL);

    let app = http::build_router(AppState {
        devices,
        logs,
        timeline,
        hub: hub.clone(),
        health,
        default_lead_time_seconds: config.default_send.lead_time_seconds,
    });

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on http://{}", addr);

    let shutdown_hub = hub.clone();
    let shutdown_monitor = Arc::clone(&monitor);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            shutdown_monitor.stop();
            shutdown_hub.close_all();
        })
        .await
        .context("http server failed")?;

    ntp.abort();
    health_logger.abort();
    watcher.abort();
    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    info!("kernel stopped");
    Ok(())
}
