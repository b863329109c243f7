use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// A persisted, append-only log line for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(job_id: JobId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
