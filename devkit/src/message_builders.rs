/*!
JSON fixtures for kernel tests

- Monitor feed messages (heartbeat, diagnostics, sendlog, reject, hello)
- Timeline payloads as accepted by the `/api/timeline/...` routes
*/

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

pub fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds monitor feed messages
pub struct MonitorMessageBuilder;

impl MonitorMessageBuilder {
    pub fn heartbeat<S: Into<String>>(device_id: S, latency_ms: f64) -> Value {
        Self::heartbeat_at(device_id, latency_ms, Utc::now())
    }

    pub fn heartbeat_at<S: Into<String>>(device_id: S, latency_ms: f64, at: DateTime<Utc>) -> Value {
        json!({
            "type": "heartbeat",
            "device_id": device_id.into(),
            "latency_ms": latency_ms,
            "timestamp": iso(at),
            "queue_depth": 0,
            "is_playing": false
        })
    }

    pub fn diagnostics<S: Into<String>>(device_id: S, reason: S, severity: S) -> Value {
        json!({
            "type": "diagnostics",
            "device_id": device_id.into(),
            "reason": reason.into(),
            "severity": severity.into(),
            "timestamp": iso(Utc::now())
        })
    }

    pub fn sendlog<S: Into<String>>(request_id: S, device_id: S, preset: S, status: S) -> Value {
        json!({
            "type": "sendlog",
            "request_id": request_id.into(),
            "device_id": device_id.into(),
            "preset": preset.into(),
            "status": status.into(),
            "scheduled_time_utc": iso(Utc::now()),
            "latency_ms": 12.0
        })
    }

    pub fn reject<S: Into<String>>(device_id: S, reason: S) -> Value {
        json!({
            "type": "reject",
            "device_id": device_id.into(),
            "reason": reason.into()
        })
    }

    pub fn hello() -> Value {
        json!({ "type": "hello", "service": "monitor" })
    }
}

#[derive(Debug, Clone, Serialize)]
struct FixtureEvent {
    time_utc: String,
    targets: Vec<String>,
    preset: String,
    lead_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    gain: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct FixtureTimeline {
    timeline_id: String,
    events: Vec<FixtureEvent>,
}

/// Builds timeline payloads; every event shares the builder's lead time
/// unless added with `event_with_lead`.
pub struct TimelineBuilder {
    timeline: FixtureTimeline,
    lead_time_ms: f64,
}

impl TimelineBuilder {
    pub fn new<S: Into<String>>(timeline_id: S) -> Self {
        Self {
            timeline: FixtureTimeline {
                timeline_id: timeline_id.into(),
                events: Vec::new(),
            },
            lead_time_ms: 3_000.0,
        }
    }

    pub fn lead_time_ms(mut self, lead_time_ms: f64) -> Self {
        self.lead_time_ms = lead_time_ms;
        self
    }

    pub fn event_at(self, at: DateTime<Utc>, preset: &str, targets: &[&str]) -> Self {
        let lead = self.lead_time_ms;
        self.event_with_lead(at, preset, targets, lead)
    }

    /// Event `offset` from now.
    pub fn event_in(self, offset: Duration, preset: &str, targets: &[&str]) -> Self {
        self.event_at(Utc::now() + offset, preset, targets)
    }

    pub fn event_with_lead(mut self, at: DateTime<Utc>, preset: &str, targets: &[&str], lead_time_ms: f64) -> Self {
        self.timeline.events.push(FixtureEvent {
            time_utc: iso(at),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            preset: preset.to_string(),
            lead_time_ms,
            gain: None,
        });
        self
    }

    /// Sets the gain of the most recently added event.
    pub fn gain(mut self, gain: f64) -> Self {
        if let Some(last) = self.timeline.events.last_mut() {
            last.gain = Some(gain);
        }
        self
    }

    pub fn build(&self) -> Value {
        serde_json::to_value(&self.timeline).unwrap_or(Value::Null)
    }
}
