//! Bounded history of flush activity.
//!
//! Tracing output is gone once the process exits; this log is what a "sync
//! center" screen reads to show what happened to the outbox recently. Every
//! backend keeps at most `capacity` entries and drops the oldest first.

mod memory;
mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wardsync_core::JobId;

use crate::kv::StorageError;

pub use memory::MemoryLog;
pub use sqlite::SqliteLog;

/// Entries kept by default.
pub const DEFAULT_LOG_CAPACITY: usize = 5_000;

/// Kind of a log entry. The names match the tracing `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogEvent {
    #[serde(rename = "flush.start")]
    FlushStart,
    #[serde(rename = "flush.job.sent")]
    JobSent,
    #[serde(rename = "flush.job.duplicate")]
    JobDuplicate,
    #[serde(rename = "flush.stop")]
    FlushStop,
    #[serde(rename = "flush.finish")]
    FlushFinish,
}

impl LogEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LogEvent::FlushStart => "flush.start",
            LogEvent::JobSent => "flush.job.sent",
            LogEvent::JobDuplicate => "flush.job.duplicate",
            LogEvent::FlushStop => "flush.stop",
            LogEvent::FlushFinish => "flush.finish",
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flush.start" => Ok(LogEvent::FlushStart),
            "flush.job.sent" => Ok(LogEvent::JobSent),
            "flush.job.duplicate" => Ok(LogEvent::JobDuplicate),
            "flush.stop" => Ok(LogEvent::FlushStop),
            "flush.finish" => Ok(LogEvent::FlushFinish),
            other => Err(format!("unknown log event {other:?}")),
        }
    }
}

/// One line of flush history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub event: LogEvent,
    pub job_id: Option<JobId>,
    pub message: String,
}

impl LogEntry {
    pub fn new(event: LogEvent, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            event,
            job_id: None,
            message: message.into(),
        }
    }

    pub fn with_job(mut self, id: &JobId) -> Self {
        self.job_id = Some(id.clone());
        self
    }
}

/// Append-only, size-capped flush history.
#[async_trait]
pub trait SyncLog: Send + Sync {
    /// Record an entry, dropping the oldest ones beyond the capacity.
    async fn append(&self, entry: LogEntry) -> Result<(), StorageError>;

    /// Up to `limit` entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError>;

    async fn count(&self) -> Result<usize, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: SyncLog + ?Sized> SyncLog for Arc<T> {
    async fn append(&self, entry: LogEntry) -> Result<(), StorageError> {
        (**self).append(entry).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        (**self).recent(limit).await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        (**self).count().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        (**self).clear().await
    }
}
