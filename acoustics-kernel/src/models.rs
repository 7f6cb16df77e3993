use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Device health tier, derived from heartbeat age and mean latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub alias: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    /// Raw ISO-8601 string as last reported; kept verbatim so an unparsable
    /// value still classifies as offline.
    pub last_heartbeat: Option<String>,
    pub ntp_offset_ms: Option<f64>,
    pub latency_mean_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub rssi: Option<f64>,
    pub battery_pct: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub queue_depth: Option<u32>,
    pub is_playing: Option<bool>,
    pub status: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl DeviceSnapshot {
    pub fn new(device_id: impl Into<String>, status: Severity, now: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            alias: None,
            ip: None,
            port: None,
            last_heartbeat: None,
            ntp_offset_ms: None,
            latency_mean_ms: None,
            latency_max_ms: None,
            rssi: None,
            battery_pct: None,
            tags: None,
            queue_depth: None,
            is_playing: None,
            status,
            last_updated: now,
        }
    }
}

/// Partial update of a snapshot. `None` means "keep the current value".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePatch {
    pub alias: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub last_heartbeat: Option<String>,
    pub ntp_offset_ms: Option<f64>,
    pub latency_mean_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub rssi: Option<f64>,
    pub battery_pct: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub queue_depth: Option<u32>,
    pub is_playing: Option<bool>,
}

impl DevicePatch {
    pub fn apply_to(self, snapshot: &mut DeviceSnapshot) {
        fn keep<T>(slot: &mut Option<T>, incoming: Option<T>) {
            if incoming.is_some() {
                *slot = incoming;
            }
        }

        keep(&mut snapshot.alias, self.alias);
        keep(&mut snapshot.ip, self.ip);
        keep(&mut snapshot.port, self.port);
        keep(&mut snapshot.last_heartbeat, self.last_heartbeat);
        keep(&mut snapshot.ntp_offset_ms, self.ntp_offset_ms);
        keep(&mut snapshot.latency_mean_ms, self.latency_mean_ms);
        keep(&mut snapshot.latency_max_ms, self.latency_max_ms);
        keep(&mut snapshot.rssi, self.rssi);
        keep(&mut snapshot.battery_pct, self.battery_pct);
        keep(&mut snapshot.tags, self.tags);
        keep(&mut snapshot.queue_depth, self.queue_depth);
        keep(&mut snapshot.is_playing, self.is_playing);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Info,
    Warn,
    Critical,
}

impl DiagnosticSeverity {
    /// Unknown or missing values fall back to `info`.
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value {
            Some("warn") => Self::Warn,
            Some("critical") => Self::Critical,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsEntry {
    pub id: String,
    pub device_id: String,
    pub reason: String,
    pub severity: DiagnosticSeverity,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Succeeded,
    Failed,
}

impl SendStatus {
    /// Anything other than an explicit `failed` / `pending` counts as delivered.
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value {
            Some("failed") => Self::Failed,
            Some("pending") => Self::Pending,
            _ => Self::Succeeded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendLogEntry {
    pub id: String,
    pub request_id: String,
    pub device_id: String,
    pub preset: String,
    pub status: SendStatus,
    pub scheduled_time_utc: String,
    pub delivered_at_utc: Option<String>,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveKind {
    Heartbeat,
    Diagnostics,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveLogEntry {
    pub id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: ReceiveKind,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Scheduled,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub request_id: String,
    pub preset: String,
    pub targets: Vec<String>,
    pub scheduled_time_utc: String,
    pub status: EventStatus,
}

impl TimelineEvent {
    /// Moves a scheduled event to a terminal status. Returns false (and leaves
    /// the event untouched) when it already settled or `status` is not terminal.
    pub fn settle(&mut self, status: EventStatus) -> bool {
        if self.status != EventStatus::Scheduled || status == EventStatus::Scheduled {
            return false;
        }
        self.status = status;
        true
    }
}

/// Messages pushed to live subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Push {
    Devices { devices: Vec<DeviceSnapshot> },
    Diagnostics { entry: DiagnosticsEntry },
    Sendlog { entry: SendLogEntry },
    Receivelog { entry: ReceiveLogEntry },
    Timeline { events: Vec<TimelineEvent> },
    Ntp { now_utc: String },
}

/// RFC 3339 truncated to milliseconds, always in UTC.
pub fn format_iso(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    let truncated = at
        .replace_nanosecond(at.nanosecond() / 1_000_000 * 1_000_000)
        .unwrap_or(at);
    truncated.format(&Rfc3339).unwrap_or_default()
}

pub fn parse_iso(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339).ok()
}

pub fn now_iso() -> String {
    format_iso(OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_patch_keeps_absent_fields() {
        let now = OffsetDateTime::now_utc();
        let mut snapshot = DeviceSnapshot::new("dev-1", Severity::Ok, now);
        snapshot.alias = Some("stage-left".into());
        snapshot.rssi = Some(-61.0);

        DevicePatch {
            ip: Some("10.0.0.5".into()),
            ..Default::default()
        }
        .apply_to(&mut snapshot);

        assert_eq!(snapshot.alias.as_deref(), Some("stage-left"));
        assert_eq!(snapshot.rssi, Some(-61.0));
        assert_eq!(snapshot.ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_settle_is_forward_only() {
        let mut event = TimelineEvent {
            id: "req-0".into(),
            request_id: "req".into(),
            preset: "chime".into(),
            targets: vec![],
            scheduled_time_utc: "2025-01-01T00:00:00Z".into(),
            status: EventStatus::Scheduled,
        };
        assert!(!event.settle(EventStatus::Scheduled));
        assert!(event.settle(EventStatus::Sent));
        assert!(!event.settle(EventStatus::Failed));
        assert_eq!(event.status, EventStatus::Sent);
    }

    #[test]
    fn test_lenient_enums() {
        assert_eq!(DiagnosticSeverity::parse_lenient(None), DiagnosticSeverity::Info);
        assert_eq!(DiagnosticSeverity::parse_lenient(Some("loud")), DiagnosticSeverity::Info);
        assert_eq!(DiagnosticSeverity::parse_lenient(Some("critical")), DiagnosticSeverity::Critical);
        assert_eq!(SendStatus::parse_lenient(Some("pending")), SendStatus::Pending);
        assert_eq!(SendStatus::parse_lenient(Some("ok")), SendStatus::Succeeded);
    }

    #[test]
    fn test_iso_helpers() {
        let at = datetime!(2025-03-01 12:00:00.250999 UTC);
        assert_eq!(format_iso(at), "2025-03-01T12:00:00.25Z");
        assert_eq!(parse_iso("2025-03-01T12:00:00Z"), Some(datetime!(2025-03-01 12:00:00 UTC)));
        assert!(parse_iso("yesterday").is_none());
    }

    #[test]
    fn test_push_wire_tags() {
        let push = Push::Ntp { now_utc: "2025-01-01T00:00:00Z".into() };
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["type"], "ntp");

        let push = Push::Receivelog {
            entry: ReceiveLogEntry {
                id: "1".into(),
                device_id: "dev".into(),
                kind: ReceiveKind::Reject,
                payload: serde_json::json!({}),
                timestamp: "t".into(),
            },
        };
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["type"], "receivelog");
        assert_eq!(json["entry"]["type"], "reject");
    }
}
