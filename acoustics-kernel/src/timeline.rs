/**
 * TIMELINE SERVICE - Validation, normalization and dispatch of show timelines
 *
 * ROLE :
 * Turns a loosely-specified list of preset events into a scheduler-ready
 * artifact with a uniform lead time, hands it to the external scheduler and
 * reconciles the per-request event status.
 *
 * PIPELINE :
 * - validate : >= 1 event, parseable times, one shared lead time (1 ms tolerance), 3 s <= lead <= 24 h
 * - normalize : short timelines (span <= 15 min) that would not play soon are
 *   shifted uniformly so the first event lands at now + lead
 * - flatten : one TimelineEvent per payload event, id "{request_id}-{index}"
 * - artifact : version 1.2, offsets in seconds from the first event
 * - invoke : temp artifact + scheduler process, exit 0 => sent, anything else => failed
 *
 * Only validation errors reach the caller; every later failure ends up as a
 * `failed` status on the request's events.
 */

use crate::audit::{AuditRecord, AuditTrail};
use crate::log_store::{BoundedLog, LOG_CAPACITY};
use crate::models::{format_iso, parse_iso, EventStatus, TimelineEvent};
use crate::scheduler::{self, SchedulerError, SchedulerSettings};
use crate::state::{new_state, Notifier, Shared};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MIN_LEAD_TIME_MS: f64 = 3_000.0;
pub const MAX_LEAD_TIME_MS: f64 = 86_400_000.0;
const LEAD_TIME_TOLERANCE_MS: f64 = 1.0;
const AUTO_SHIFT_MAX_SPAN: Duration = Duration::minutes(15);
const AUTO_SHIFT_EARLY_SLACK: Duration = Duration::seconds(5);
const AUTO_SHIFT_LATE_SLACK: Duration = Duration::hours(2);

pub const ARTIFACT_VERSION: &str = "1.2";
pub const PLAY_ADDRESS: &str = "/acoustics/play";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TimelineError {
    #[error("timeline must contain at least one event")]
    Empty,
    #[error("event {index} has an invalid time_utc: {value}")]
    InvalidTime { index: usize, value: String },
    #[error("event {index} has a negative lead_time_ms ({value})")]
    NegativeLeadTime { index: usize, value: f64 },
    #[error("all events must share one lead time (event {index} has {found} ms, expected {expected} ms)")]
    MixedLeadTimes { index: usize, expected: f64, found: f64 },
    #[error("lead time must be at least {min} ms (got {found} ms)")]
    LeadTimeTooShort { found: f64, min: f64 },
    #[error("lead time must be at most {max} ms (got {found} ms)")]
    LeadTimeTooLong { found: f64, max: f64 },
    #[error("scheduled time out of range")]
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePayload {
    pub timeline_id: String,
    pub events: Vec<TimelinePayloadEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePayloadEvent {
    pub time_utc: String,
    pub targets: Vec<String>,
    pub preset: String,
    pub lead_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
}

/// A single-event dispatch at `now + lead_time_ms`.
#[derive(Debug, Clone, PartialEq)]
pub struct FireCommand {
    pub preset_id: String,
    pub targets: Vec<String>,
    pub lead_time_ms: f64,
    pub gain_db: Option<f64>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub at: OffsetDateTime,
    pub targets: Vec<String>,
    pub preset: String,
    pub gain: Option<f64>,
}

/// Validated timeline, sorted by time, possibly auto-shifted.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTimeline {
    pub timeline_id: String,
    pub lead_time_ms: f64,
    pub events: Vec<NormalizedEvent>,
    pub shift: Duration,
    /// Earliest event minus the lead time.
    pub base_time: OffsetDateTime,
}

impl NormalizedTimeline {
    pub fn lead(&self) -> Duration {
        Duration::milliseconds(self.lead_time_ms.round() as i64)
    }

    pub fn lead_time_seconds(&self) -> f64 {
        self.lead_time_ms / 1000.0
    }

    pub fn artifact(&self) -> SchedulerArtifact {
        let first = self.events[0].at;
        SchedulerArtifact {
            version: ARTIFACT_VERSION.to_string(),
            default_lead_time: self.lead_time_seconds(),
            metadata: ArtifactMetadata {
                source_timeline_id: self.timeline_id.clone(),
            },
            events: self
                .events
                .iter()
                .map(|event| ArtifactEvent {
                    offset: offset_seconds(first, event.at),
                    address: PLAY_ADDRESS.to_string(),
                    targets: event.targets.clone(),
                    args: vec![
                        serde_json::Value::from(event.preset.clone()),
                        serde_json::Value::from(0),
                        serde_json::Value::from(event.gain.unwrap_or(1.0)),
                        serde_json::Value::from(0),
                    ],
                })
                .collect(),
        }
    }

    fn flatten(&self, request_id: &str) -> Vec<TimelineEvent> {
        self.events
            .iter()
            .enumerate()
            .map(|(index, event)| TimelineEvent {
                id: format!("{}-{}", request_id, index),
                request_id: request_id.to_string(),
                preset: event.preset.clone(),
                targets: event.targets.clone(),
                scheduled_time_utc: format_iso(event.at),
                status: EventStatus::Scheduled,
            })
            .collect()
    }
}

/// Seconds from `first` to `at`, rounded to the millisecond.
fn offset_seconds(first: OffsetDateTime, at: OffsetDateTime) -> f64 {
    let nanos = (at - first).whole_nanoseconds() as f64;
    (nanos / 1_000_000.0).round() / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerArtifact {
    pub version: String,
    pub default_lead_time: f64,
    pub metadata: ArtifactMetadata,
    pub events: Vec<ArtifactEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub source_timeline_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEvent {
    pub offset: f64,
    pub address: String,
    pub targets: Vec<String>,
    pub args: Vec<serde_json::Value>,
}

/// Validates the payload and returns the shared lead time in milliseconds.
pub fn validate(payload: &TimelinePayload) -> Result<f64, TimelineError> {
    let first = payload.events.first().ok_or(TimelineError::Empty)?;

    for (index, event) in payload.events.iter().enumerate() {
        if parse_iso(&event.time_utc).is_none() {
            return Err(TimelineError::InvalidTime {
                index,
                value: event.time_utc.clone(),
            });
        }
        if event.lead_time_ms < 0.0 || !event.lead_time_ms.is_finite() {
            return Err(TimelineError::NegativeLeadTime {
                index,
                value: event.lead_time_ms,
            });
        }
        if (event.lead_time_ms - first.lead_time_ms).abs() > LEAD_TIME_TOLERANCE_MS {
            return Err(TimelineError::MixedLeadTimes {
                index,
                expected: first.lead_time_ms,
                found: event.lead_time_ms,
            });
        }
    }

    if first.lead_time_ms < MIN_LEAD_TIME_MS {
        return Err(TimelineError::LeadTimeTooShort {
            found: first.lead_time_ms,
            min: MIN_LEAD_TIME_MS,
        });
    }
    if first.lead_time_ms > MAX_LEAD_TIME_MS {
        return Err(TimelineError::LeadTimeTooLong {
            found: first.lead_time_ms,
            max: MAX_LEAD_TIME_MS,
        });
    }
    Ok(first.lead_time_ms)
}

/// Offset that moves a short timeline so its first event plays at
/// `now + lead`, or zero when no shift applies.
pub fn auto_shift(
    first: OffsetDateTime,
    last: OffsetDateTime,
    lead: Duration,
    now: OffsetDateTime,
) -> Result<Duration, TimelineError> {
    if last - first > AUTO_SHIFT_MAX_SPAN {
        return Ok(Duration::ZERO);
    }
    let target = now.checked_add(lead).ok_or(TimelineError::OutOfRange)?;
    let window_start = target
        .checked_sub(AUTO_SHIFT_EARLY_SLACK)
        .ok_or(TimelineError::OutOfRange)?;
    let window_end = target
        .checked_add(AUTO_SHIFT_LATE_SLACK)
        .ok_or(TimelineError::OutOfRange)?;
    if first >= window_start && first <= window_end {
        return Ok(Duration::ZERO);
    }
    Ok(target - first)
}

/// Validate, sort and auto-shift.
pub fn normalize(payload: &TimelinePayload, now: OffsetDateTime) -> Result<NormalizedTimeline, TimelineError> {
    let lead_time_ms = validate(payload)?;

    let mut events: Vec<NormalizedEvent> = payload
        .events
        .iter()
        .enumerate()
        .map(|(index, event)| {
            let at = parse_iso(&event.time_utc).ok_or_else(|| TimelineError::InvalidTime {
                index,
                value: event.time_utc.clone(),
            })?;
            Ok(NormalizedEvent {
                at,
                targets: event.targets.clone(),
                preset: event.preset.clone(),
                gain: event.gain,
            })
        })
        .collect::<Result<_, TimelineError>>()?;
    events.sort_by_key(|event| event.at);

    let mut timeline = NormalizedTimeline {
        timeline_id: payload.timeline_id.clone(),
        lead_time_ms,
        events,
        shift: Duration::ZERO,
        base_time: now,
    };

    let first = timeline.events[0].at;
    let last = timeline.events[timeline.events.len() - 1].at;
    let shift = auto_shift(first, last, timeline.lead(), now)?;
    if !shift.is_zero() {
        info!(
            timeline_id = %timeline.timeline_id,
            shift_ms = shift.whole_milliseconds() as i64,
            "auto-shifting timeline"
        );
        for event in &mut timeline.events {
            event.at = event.at.checked_add(shift).ok_or(TimelineError::OutOfRange)?;
        }
        timeline.shift = shift;
    }
    timeline.base_time = timeline.events[0]
        .at
        .checked_sub(timeline.lead())
        .ok_or(TimelineError::OutOfRange)?;
    Ok(timeline)
}

#[derive(Debug, Serialize)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub events: Vec<TimelineEvent>,
    /// Background reconciliation; `None` when the invocation short-circuited.
    #[serde(skip)]
    pub invocation: Option<JoinHandle<EventStatus>>,
}

struct TimelineInner {
    events: Shared<BoundedLog<TimelineEvent>>,
    notifier: Notifier<Vec<TimelineEvent>>,
    audit: AuditTrail,
    settings: SchedulerSettings,
}

#[derive(Clone)]
pub struct TimelineService {
    inner: Arc<TimelineInner>,
}

impl TimelineService {
    pub fn new(settings: SchedulerSettings, audit: AuditTrail) -> Self {
        Self {
            inner: Arc::new(TimelineInner {
                events: new_state(BoundedLog::new(LOG_CAPACITY)),
                notifier: Notifier::new(),
                audit,
                settings,
            }),
        }
    }

    pub fn notifier(&self) -> &Notifier<Vec<TimelineEvent>> {
        &self.inner.notifier
    }

    /// Buffered events, oldest first.
    pub fn events(&self) -> Vec<TimelineEvent> {
        self.inner.events.lock().to_vec()
    }

    pub fn events_for(&self, request_id: &str) -> Vec<TimelineEvent> {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|event| event.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn preview(&self, payload: &TimelinePayload) -> Result<Vec<TimelineEvent>, TimelineError> {
        let timeline = normalize(payload, OffsetDateTime::now_utc())?;
        Ok(timeline.flatten(&Uuid::new_v4().to_string()))
    }

    pub async fn dispatch(
        &self,
        payload: &TimelinePayload,
        request_id: Option<String>,
    ) -> Result<DispatchOutcome, TimelineError> {
        let timeline = normalize(payload, OffsetDateTime::now_utc())?;
        let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let events = timeline.flatten(&request_id);

        self.inner.notifier.publish_after(|| {
            let mut log = self.inner.events.lock();
            log.extend(events.iter().cloned());
            ((), log.to_vec())
        });
        self.inner
            .audit
            .record(AuditRecord::timeline_dispatch(&request_id, &timeline.timeline_id))
            .await;
        info!(
            request_id = %request_id,
            timeline_id = %timeline.timeline_id,
            events = events.len(),
            "timeline dispatched"
        );

        let invocation = self.invoke_scheduler(timeline, &request_id).await;
        Ok(DispatchOutcome {
            request_id: request_id.clone(),
            events: self.events_for(&request_id),
            invocation,
        })
    }

    pub async fn fire(&self, command: FireCommand) -> Result<DispatchOutcome, TimelineError> {
        let request_id = command
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if command.lead_time_ms > MAX_LEAD_TIME_MS {
            return Err(TimelineError::LeadTimeTooLong {
                found: command.lead_time_ms,
                max: MAX_LEAD_TIME_MS,
            });
        }
        let at = OffsetDateTime::now_utc()
            .checked_add(Duration::milliseconds(command.lead_time_ms.round() as i64))
            .ok_or(TimelineError::OutOfRange)?;
        let payload = TimelinePayload {
            timeline_id: format!("single-fire-{}", request_id),
            events: vec![TimelinePayloadEvent {
                time_utc: format_iso(at),
                targets: command.targets,
                preset: command.preset_id,
                lead_time_ms: command.lead_time_ms,
                gain: command.gain_db,
            }],
        };
        self.dispatch(&payload, Some(request_id)).await
    }

    /// Short-circuits (marks failed, no spawn) when the binary is missing or
    /// the artifact cannot be written; otherwise returns the process task.
    async fn invoke_scheduler(
        &self,
        timeline: NormalizedTimeline,
        request_id: &str,
    ) -> Option<JoinHandle<EventStatus>> {
        let settings = &self.inner.settings;
        if !settings.binary_exists() {
            warn!("{}", SchedulerError::BinaryMissing(settings.binary.clone()));
            self.settle(request_id, EventStatus::Failed);
            return None;
        }

        let artifact = timeline.artifact();
        let name = if timeline.timeline_id.is_empty() {
            request_id.to_string()
        } else {
            timeline.timeline_id.clone()
        };
        let (temp_dir, artifact_path) = match scheduler::write_artifact(&name, &artifact).await {
            Ok(written) => written,
            Err(e) => {
                error!(request_id = %request_id, "{}", e);
                self.settle(request_id, EventStatus::Failed);
                return None;
            }
        };

        let args = settings.build_args(&artifact_path, timeline.lead_time_seconds(), timeline.base_time);
        self.inner
            .audit
            .record(AuditRecord::scheduler_exec(request_id, args.clone()))
            .await;

        let service = self.clone();
        let request_id = request_id.to_string();
        Some(tokio::spawn(async move {
            let binary = service.inner.settings.binary.clone();
            let status = match scheduler::run(&binary, &args).await {
                Ok(result) => {
                    info!(
                        request_id = %request_id,
                        execution_time_ms = result.execution_time_ms as u64,
                        "scheduler finished"
                    );
                    EventStatus::Sent
                }
                Err(e) => {
                    error!(request_id = %request_id, "scheduler failed: {}", e);
                    EventStatus::Failed
                }
            };
            drop(temp_dir);
            service.settle(&request_id, status);
            status
        }))
    }

    /// Moves every still-scheduled event of the request to `status` and
    /// publishes the full list.
    fn settle(&self, request_id: &str, status: EventStatus) {
        self.inner.notifier.publish_after(|| {
            let mut events = self.inner.events.lock();
            for event in events.iter_mut().filter(|e| e.request_id == request_id) {
                event.settle(status);
            }
            ((), events.to_vec())
        });
    }
}
