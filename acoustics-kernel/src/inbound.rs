//! Normalization of monitor feed messages.
//!
//! The feed is loosely typed: fields of the wrong JSON type are treated as
//! absent and replaced by defaults. Only a missing/unknown envelope or a
//! heartbeat without a device id is an error.

use crate::devices::HeartbeatUpdate;
use crate::models::{
    now_iso, DiagnosticSeverity, DiagnosticsEntry, ReceiveKind, ReceiveLogEntry, SendLogEntry, SendStatus,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("message is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type`")]
    MissingType,
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Heartbeat {
        update: HeartbeatUpdate,
        entry: ReceiveLogEntry,
    },
    Diagnostics(DiagnosticsEntry),
    Sendlog(SendLogEntry),
    /// `reject` and every unrecognized type.
    Received(ReceiveLogEntry),
    Hello,
}

/// A present field of the wrong type reads as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Envelope {
    #[serde(rename = "type", deserialize_with = "lenient")]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawHeartbeat {
    #[serde(deserialize_with = "lenient")]
    device_id: Option<String>,
    // older agents send `id`; `device_id` wins when both are present
    #[serde(deserialize_with = "lenient")]
    id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    latency_ms: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    timestamp: Option<String>,
    #[serde(deserialize_with = "lenient")]
    queue_depth: Option<u32>,
    #[serde(deserialize_with = "lenient")]
    is_playing: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDiagnostics {
    #[serde(deserialize_with = "lenient")]
    device_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    reason: Option<String>,
    #[serde(deserialize_with = "lenient")]
    severity: Option<String>,
    #[serde(deserialize_with = "lenient")]
    timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSendlog {
    #[serde(deserialize_with = "lenient")]
    request_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    device_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    preset: Option<String>,
    #[serde(deserialize_with = "lenient")]
    status: Option<String>,
    #[serde(deserialize_with = "lenient")]
    scheduled_time_utc: Option<String>,
    #[serde(deserialize_with = "lenient")]
    delivered_at_utc: Option<String>,
    #[serde(deserialize_with = "lenient")]
    latency_ms: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawReceived {
    #[serde(deserialize_with = "lenient")]
    device_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    timestamp: Option<String>,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(InboundError::NotAnObject);
        }
        let kind = Envelope::deserialize(&value)?
            .kind
            .ok_or(InboundError::MissingType)?;

        Ok(match kind.as_str() {
            "heartbeat" => RawHeartbeat::deserialize(&value)?.into_message(value)?,
            "diagnostics" => Self::Diagnostics(RawDiagnostics::deserialize(&value)?.into_entry()),
            "sendlog" => Self::Sendlog(RawSendlog::deserialize(&value)?.into_entry()),
            "hello" => Self::Hello,
            "reject" => Self::Received(RawReceived::deserialize(&value)?.into_entry(
                value,
                ReceiveKind::Reject,
                "unknown",
            )),
            _ => Self::Received(RawReceived::deserialize(&value)?.into_entry(
                value,
                ReceiveKind::Diagnostics,
                "n/a",
            )),
        })
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl RawHeartbeat {
    fn into_message(self, payload: Value) -> Result<InboundMessage, InboundError> {
        let device_id = self.device_id.or(self.id).ok_or(InboundError::Malformed {
            kind: "heartbeat",
            reason: "missing device_id",
        })?;

        let update = HeartbeatUpdate {
            device_id: device_id.clone(),
            latency_ms: self.latency_ms,
            timestamp: self.timestamp.clone(),
            queue_depth: self.queue_depth,
            is_playing: self.is_playing,
        };
        let entry = ReceiveLogEntry {
            id: new_id(),
            device_id,
            kind: ReceiveKind::Heartbeat,
            timestamp: self.timestamp.unwrap_or_else(now_iso),
            payload,
        };
        Ok(InboundMessage::Heartbeat { update, entry })
    }
}

impl RawDiagnostics {
    fn into_entry(self) -> DiagnosticsEntry {
        DiagnosticsEntry {
            id: new_id(),
            device_id: self.device_id.unwrap_or_else(|| "unknown".into()),
            reason: self.reason.unwrap_or_else(|| "Unknown diagnostics".into()),
            severity: DiagnosticSeverity::parse_lenient(self.severity.as_deref()),
            timestamp: self.timestamp.unwrap_or_else(now_iso),
        }
    }
}

impl RawSendlog {
    fn into_entry(self) -> SendLogEntry {
        SendLogEntry {
            id: new_id(),
            request_id: self.request_id.unwrap_or_else(new_id),
            device_id: self.device_id.unwrap_or_else(|| "unknown".into()),
            preset: self.preset.unwrap_or_else(|| "unknown".into()),
            status: SendStatus::parse_lenient(self.status.as_deref()),
            scheduled_time_utc: self.scheduled_time_utc.unwrap_or_else(now_iso),
            delivered_at_utc: self.delivered_at_utc,
            latency_ms: self.latency_ms,
            error: self.error,
        }
    }
}

impl RawReceived {
    fn into_entry(self, payload: Value, kind: ReceiveKind, default_device: &str) -> ReceiveLogEntry {
        ReceiveLogEntry {
            id: new_id(),
            device_id: self.device_id.unwrap_or_else(|| default_device.to_string()),
            kind,
            timestamp: self.timestamp.unwrap_or_else(now_iso),
            payload,
        }
    }
}
