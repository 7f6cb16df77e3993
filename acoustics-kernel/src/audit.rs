use crate::models::{now_iso, SendLogEntry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    TimelineDispatch {
        request_id: String,
        timeline_id: String,
        recorded_at: String,
    },
    SchedulerExec {
        request_id: String,
        args: Vec<String>,
        recorded_at: String,
    },
    Sendlog {
        entry: SendLogEntry,
        recorded_at: String,
    },
}

impl AuditRecord {
    pub fn timeline_dispatch(request_id: &str, timeline_id: &str) -> Self {
        Self::TimelineDispatch {
            request_id: request_id.to_string(),
            timeline_id: timeline_id.to_string(),
            recorded_at: now_iso(),
        }
    }

    pub fn scheduler_exec(request_id: &str, args: Vec<String>) -> Self {
        Self::SchedulerExec {
            request_id: request_id.to_string(),
            args,
            recorded_at: now_iso(),
        }
    }

    pub fn sendlog(entry: SendLogEntry) -> Self {
        Self::Sendlog {
            entry,
            recorded_at: now_iso(),
        }
    }
}

/// Append-only JSON-lines file. Independent from the bounded in-memory logs.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    path: PathBuf,
}

impl AuditTrail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Appends and logs failures instead of returning them.
    pub async fn record(&self, record: AuditRecord) {
        if let Err(e) = self.append(&record).await {
            tracing::warn!(path = %self.path.display(), error = %e, "audit append failed");
        }
    }
}
