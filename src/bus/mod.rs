//! Observer Bus: in-process publish/subscribe with
//! at-least-once delivery to currently-connected subscribers. Backed by
//! `tokio::sync::broadcast`, whose bounded-capacity-drops-the-laggard
//! behavior is exactly the "subscribers that fall behind are dropped"
//! requirement, so no extra bookkeeping is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{JobId, JobStatus, LogEntry};

/// One engine event, tagged by `type` for subscribers that deserialize
/// generically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StatusChange {
        job_id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
    },
    Progress {
        job_id: JobId,
        last_id: i64,
        delivered_count: usize,
        skipped_count: usize,
        failed_count: usize,
        success_rate: f64,
        error_rate: f64,
        messages_per_minute: f64,
    },
    Log {
        job_id: JobId,
        entry: LogEntry,
    },
    FloodWait {
        job_id: JobId,
        account_id: String,
        seconds: u64,
    },
    Error {
        job_id: JobId,
        message: String,
    },
    Completed {
        job_id: JobId,
    },
}

impl Event {
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::StatusChange { job_id, .. }
            | Event::Progress { job_id, .. }
            | Event::Log { job_id, .. }
            | Event::FloodWait { job_id, .. }
            | Event::Error { job_id, .. }
            | Event::Completed { job_id } => job_id,
        }
    }
}

/// Fan-out hub. Cloning is cheap (`broadcast::Sender` is an `Arc` inside).
#[derive(Clone)]
pub struct ObserverBus {
    sender: broadcast::Sender<Event>,
}

impl ObserverBus {
    pub fn new(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog);
        Self { sender }
    }

    /// Publish to all current subscribers. No-op (not an error) if nobody
    /// is currently listening.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
