/**
 * HTTP API - Dashboard-facing REST and WebSocket surface of the kernel
 *
 * ROLE :
 * Read access to device snapshots, bounded logs and timeline events, plus the
 * three commands that reach the scheduler (preview, send, fire).
 *
 * ROUTES :
 * - GET  /api/health, /api/devices, /api/devices/{id}, /api/diagnostics,
 *        /api/sendlog, /api/receivelog, /api/timeline, /api/ntp
 * - POST /api/timeline/preview, /api/timeline/send, /api/fire
 * - GET  /ws : live push stream (devices, logs, timeline, ntp)
 *
 * ERRORS :
 * Malformed bodies and validation failures answer 400 {"error": "..."}.
 */

use crate::devices::DeviceStore;
use crate::health::{HealthTracker, KernelHealth};
use crate::hub::BroadcastHub;
use crate::log_store::LogStores;
use crate::models::{now_iso, DeviceSnapshot};
use crate::timeline::{FireCommand, TimelineError, TimelinePayload, TimelineService};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub devices: Arc<DeviceStore>,
    pub logs: LogStores,
    pub timeline: TimelineService,
    pub hub: BroadcastHub,
    pub health: HealthTracker,
    pub default_lead_time_seconds: f64,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl From<TimelineError> for ApiError {
    fn from(e: TimelineError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
        };
        warn!("request failed ({}): {}", status, message);
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct FireRequest {
    preset_id: String,
    targets: Vec<String>,
    lead_time_seconds: Option<f64>,
    gain_db: Option<f64>,
    request_id: Option<String>,
}

impl FireRequest {
    fn into_command(self, default_lead_time_seconds: f64) -> Result<FireCommand, ApiError> {
        if self.preset_id.trim().is_empty() {
            return Err(ApiError::BadRequest("preset_id must not be empty".into()));
        }
        if self.targets.is_empty() {
            return Err(ApiError::BadRequest("targets must contain at least one device".into()));
        }
        let lead = self.lead_time_seconds.unwrap_or(default_lead_time_seconds);
        if lead <= 0.0 || !lead.is_finite() {
            return Err(ApiError::BadRequest("lead_time_seconds must be positive".into()));
        }
        Ok(FireCommand {
            preset_id: self.preset_id,
            targets: self.targets,
            lead_time_ms: (lead * 1000.0).round(),
            gain_db: self.gain_db,
            request_id: self.request_id,
        })
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/devices", get(get_devices))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/diagnostics", get(get_diagnostics))
        .route("/api/sendlog", get(get_sendlog))
        .route("/api/receivelog", get(get_receivelog))
        .route("/api/timeline", get(get_timeline))
        .route("/api/ntp", get(|| async { Json(json!({ "now_utc": now_iso() })) }))
        .route("/api/timeline/preview", post(preview_timeline))
        .route("/api/timeline/send", post(send_timeline))
        .route("/api/fire", post(fire))
        .route("/ws", get(live_ws))
        .with_state(app_state)
}

async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health())
}

async fn get_devices(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "devices": app.devices.all() }))
}

async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceSnapshot>, ApiError> {
    app.devices
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown device {}", id)))
}

async fn get_diagnostics(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "diagnostics": app.logs.diagnostics.lock().to_vec() }))
}

async fn get_sendlog(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "entries": app.logs.sendlog.lock().to_vec() }))
}

async fn get_receivelog(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "entries": app.logs.receivelog.lock().to_vec() }))
}

async fn get_timeline(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "events": app.timeline.events() }))
}

async fn preview_timeline(
    State(app): State<AppState>,
    payload: Result<Json<TimelinePayload>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(payload) = payload?;
    let events = app.timeline.preview(&payload)?;
    Ok(Json(json!({ "events": events })))
}

async fn send_timeline(
    State(app): State<AppState>,
    payload: Result<Json<TimelinePayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    let outcome = app.timeline.dispatch(&payload, None).await?;
    Ok(Json(outcome).into_response())
}

async fn fire(
    State(app): State<AppState>,
    request: Result<Json<FireRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let command = request.into_command(app.default_lead_time_seconds)?;
    let outcome = app.timeline.fire(command).await?;
    Ok(Json(outcome).into_response())
}

async fn live_ws(State(app): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_pushes(socket, app.hub))
}

/// Forwards hub pushes until either side goes away.
async fn stream_pushes(socket: WebSocket, hub: BroadcastHub) {
    let mut subscription = hub.subscribe();
    let id = subscription.id();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            push = subscription.recv() => match push {
                Some(text) => {
                    if sender.send(Message::Text(text.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    debug!(subscriber = id, "live socket closed");
}
