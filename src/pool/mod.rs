//! Account Pool: holds one live `Transport` per authenticated
//! account and hands out eligible accounts to workers round-robin.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::domain::{AccountId, JobId};
use crate::governor::RateGovernor;
use crate::transport::Transport;

struct Handle {
    transport: Arc<dyn Transport>,
    /// Serializes send calls on this handle — transports are not
    /// reentrantly usable for concurrent sends by multiple workers.
    send_lock: Arc<Mutex<()>>,
}

pub struct AccountPool {
    governor: Arc<RateGovernor>,
    handles: Mutex<HashMap<AccountId, Handle>>,
    /// Accounts marked unhealthy *for a specific job*: pre-flight and
    /// write-permission failures are scoped to the job, not global.
    unhealthy_for_job: Mutex<HashMap<JobId, HashSet<AccountId>>>,
}

impl AccountPool {
    pub fn new(governor: Arc<RateGovernor>) -> Self {
        Self {
            governor,
            handles: Mutex::new(HashMap::new()),
            unhealthy_for_job: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, account_id: AccountId, transport: Arc<dyn Transport>) {
        self.handles.lock().await.insert(
            account_id,
            Handle {
                transport,
                send_lock: Arc::new(Mutex::new(())),
            },
        );
    }

    pub async fn get_handle(&self, account_id: &AccountId) -> Option<Arc<dyn Transport>> {
        self.handles
            .lock()
            .await
            .get(account_id)
            .map(|h| h.transport.clone())
    }

    pub async fn send_lock(&self, account_id: &AccountId) -> Option<Arc<Mutex<()>>> {
        self.handles
            .lock()
            .await
            .get(account_id)
            .map(|h| h.send_lock.clone())
    }

    pub async fn mark_unhealthy(&self, job_id: &JobId, account_id: &AccountId, reason: &str) {
        tracing::warn!(job_id = %job_id, account_id = %account_id, reason, "marking account unhealthy for job");
        self.unhealthy_for_job
            .lock()
            .await
            .entry(job_id.clone())
            .or_default()
            .insert(account_id.clone());
    }

    pub async fn is_healthy_for_job(&self, job_id: &JobId, account_id: &AccountId) -> bool {
        !self
            .unhealthy_for_job
            .lock()
            .await
            .get(job_id)
            .is_some_and(|set| set.contains(account_id))
    }

    pub async fn clear_job(&self, job_id: &JobId) {
        self.unhealthy_for_job.lock().await.remove(job_id);
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// A round-robin cycle over `account_ids` scoped to `job_id`.
    pub fn cycle(self: &Arc<Self>, job_id: JobId, account_ids: Vec<AccountId>) -> JobAccountCycle {
        JobAccountCycle {
            pool: self.clone(),
            job_id,
            account_ids,
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Hands out the next eligible account for one job, round-robin, blocking
/// (capped at 30s) while every account is flood-waiting.
pub struct JobAccountCycle {
    pool: Arc<AccountPool>,
    job_id: JobId,
    account_ids: Vec<AccountId>,
    cursor: AtomicUsize,
}

impl JobAccountCycle {
    /// Returns the next eligible account, or `None` if every account
    /// assigned to the job is unhealthy (no amount of waiting will help —
    /// the worker should fail the job).
    pub async fn next_eligible(&self) -> Option<AccountId> {
        loop {
            let ordered = self.round_order();

            let mut any_healthy = false;
            for id in &ordered {
                if self.pool.is_healthy_for_job(&self.job_id, id).await {
                    any_healthy = true;
                    if self.pool.governor.is_eligible(id).await {
                        return Some(id.clone());
                    }
                }
            }
            if !any_healthy {
                return None;
            }

            let mut wait = Duration::from_secs(30);
            for id in &ordered {
                if self.pool.is_healthy_for_job(&self.job_id, id).await {
                    if let Some(until) = self.pool.governor.next_eligible_at(id).await {
                        let remaining = until.saturating_duration_since(Instant::now());
                        wait = wait.min(remaining);
                    }
                }
            }
            tokio::time::sleep(wait).await;
        }
    }

    fn round_order(&self) -> Vec<AccountId> {
        let len = self.account_ids.len();
        if len == 0 {
            return vec![];
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        (0..len).map(|i| self.account_ids[(start + i) % len].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{FakeTransport, FakeWorld};

    #[tokio::test]
    async fn cycle_skips_unhealthy_accounts() {
        let governor = Arc::new(RateGovernor::new());
        let pool = Arc::new(AccountPool::new(governor));
        let world = FakeWorld::new();
        pool.register("a".into(), Arc::new(FakeTransport::new("a", world.clone())))
            .await;
        pool.register("b".into(), Arc::new(FakeTransport::new("b", world.clone())))
            .await;

        pool.mark_unhealthy(&"job1".to_string(), &"a".to_string(), "no perms")
            .await;

        let cycle = pool.cycle("job1".to_string(), vec!["a".into(), "b".into()]);
        for _ in 0..3 {
            assert_eq!(cycle.next_eligible().await, Some("b".to_string()));
        }
    }

    #[tokio::test]
    async fn cycle_returns_none_when_all_unhealthy() {
        let governor = Arc::new(RateGovernor::new());
        let pool = Arc::new(AccountPool::new(governor));
        pool.mark_unhealthy(&"job1".to_string(), &"a".to_string(), "x").await;
        let cycle = pool.cycle("job1".to_string(), vec!["a".into()]);
        assert_eq!(cycle.next_eligible().await, None);
    }
}
