use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::AccountId;
use super::chat::ChatRef;

pub type JobId = String;

/// One token in a `FilterPolicy`. The policy as a whole is the *set* of
/// tokens the operator selected, so we model it as a set rather than a
/// single enum variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    TextOnly,
    AllMedia,
    Images,
    Videos,
    Audio,
    Documents,
}

/// Filter Policy: the set of selected `FilterKind`s plus an optional set of
/// literal file extensions (lowercase, no dot) checked against documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterPolicy {
    pub kinds: HashSet<FilterKind>,
    pub extensions: HashSet<String>,
}

impl FilterPolicy {
    pub fn text_only() -> Self {
        Self {
            kinds: HashSet::from([FilterKind::TextOnly]),
            extensions: HashSet::new(),
        }
    }

    pub fn all_media() -> Self {
        Self {
            kinds: HashSet::from([FilterKind::AllMedia]),
            extensions: HashSet::new(),
        }
    }

    pub fn contains(&self, kind: FilterKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Per-job rate parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateParams {
    pub inter_message_delay_secs: f64,
    pub max_messages_per_minute: u32,
}

impl Default for RateParams {
    fn default() -> Self {
        Self {
            inter_message_delay_secs: 2.0,
            max_messages_per_minute: 20,
        }
    }
}

/// Durable progress record for one job.
///
/// `last_id` is the highest source message id whose *attempt* has been
/// fully accounted for (last-attempted, not last-delivered — resuming a
/// job replays nothing before this point even if the send itself failed).
/// `delivered` is the set of ids actually acknowledged as
/// sent and is bounded to the most recent `DELIVERED_BOUND` entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressCursor {
    pub last_id: i64,
    pub delivered: HashSet<i64>,
}

/// Lower bound on the retained size of `delivered`. Trimming drops the
/// oldest (smallest) ids, which is safe because source ids are monotonic.
pub const DELIVERED_BOUND: usize = 100_000;

impl ProgressCursor {
    pub fn reset(&mut self) {
        self.last_id = 0;
        self.delivered.clear();
    }

    pub fn already_accounted_for(&self, id: i64) -> bool {
        id <= self.last_id || self.delivered.contains(&id)
    }

    /// Drop the oldest entries in `delivered` until it fits `DELIVERED_BOUND`.
    pub fn trim(&mut self) {
        if self.delivered.len() <= DELIVERED_BOUND {
            return;
        }
        let mut ids: Vec<i64> = self.delivered.iter().copied().collect();
        ids.sort_unstable();
        let drop_count = ids.len() - DELIVERED_BOUND;
        for id in &ids[..drop_count] {
            self.delivered.remove(id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

/// A durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub source_ref: ChatRef,
    pub target_ref: ChatRef,
    pub account_ids: Vec<AccountId>,
    pub filter_policy: FilterPolicy,
    pub rate_params: RateParams,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reset_progress: bool,
    /// Inert pass-through metadata for the HTTP collaborator. No scheduler
    /// in this engine reads `schedule_cron`; the client is expected to call
    /// `start`/`stop` on its own cadence.
    pub schedule_enabled: bool,
    pub schedule_cron: Option<String>,
    pub auto_restart: bool,
}

impl Job {
    pub fn new(
        id: JobId,
        name: String,
        source_ref: ChatRef,
        target_ref: ChatRef,
        account_ids: Vec<AccountId>,
        filter_policy: FilterPolicy,
        rate_params: RateParams,
    ) -> Self {
        Self {
            id,
            name,
            description: None,
            source_ref,
            target_ref,
            account_ids,
            filter_policy,
            rate_params,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            reset_progress: false,
            schedule_enabled: false,
            schedule_cron: None,
            auto_restart: false,
        }
    }

    /// Apply a status transition, setting timestamps: `started_at` is set
    /// once and never cleared.
    pub fn transition(&mut self, status: JobStatus) {
        if status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if matches!(
            status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        ) {
            self.completed_at = Some(Utc::now());
        }
        self.status = status;
    }
}
