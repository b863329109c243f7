//! Job Supervisor: owns the lifecycle of every job — create,
//! start, stop, delete, enumerate, and recovery on process restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::{Event, ObserverBus};
use crate::domain::{Job, JobId, JobStatus};
use crate::error::{EngineError, EngineResult};
use crate::pool::AccountPool;
use crate::store::SqliteStore;
use crate::worker::{ForwardingWorker, StopFlag};

struct RunningWorker {
    stop: StopFlag,
    handle: JoinHandle<()>,
}

/// Engine-wide aggregate counts, returned by `GET /stats`.
#[derive(Debug, Serialize)]
pub struct Stats {
    pub pending: u32,
    pub running: u32,
    pub paused: u32,
    pub completed: u32,
    pub failed: u32,
    pub stopped: u32,
    pub accounts_connected: u32,
    pub total_messages_delivered: u64,
}

pub struct JobSupervisor {
    store: Arc<SqliteStore>,
    pool: Arc<AccountPool>,
    bus: ObserverBus,
    running: Mutex<HashMap<JobId, RunningWorker>>,
}

impl JobSupervisor {
    pub fn new(store: Arc<SqliteStore>, pool: Arc<AccountPool>, bus: ObserverBus) -> Self {
        Self {
            store,
            pool,
            bus,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Run once at process start: any job persisted as `running` did not
    /// survive its process and is demoted to `pending` rather than
    /// silently auto-restarted.
    pub async fn recover(&self) -> EngineResult<()> {
        let demoted = self.store.demote_running_jobs().await?;
        for job_id in demoted {
            info!(job_id = %job_id, "demoted running job to pending on startup recovery");
            self.bus.publish(Event::StatusChange {
                job_id,
                status: JobStatus::Pending,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Validates the assigned accounts are authenticated and persists the
    /// job. Source/target resolution is deferred to worker start, which is
    /// the only point a live `Transport` is available.
    pub async fn create_job(&self, job: Job) -> EngineResult<Job> {
        if job.account_ids.is_empty() {
            return Err(EngineError::internal("job must have at least one account"));
        }
        for account_id in &job.account_ids {
            let account = self
                .store
                .get_account(account_id)
                .await?
                .ok_or_else(|| EngineError::AccountNotFound(account_id.clone()))?;
            if !account.is_usable() {
                return Err(EngineError::internal(format!(
                    "account {account_id} is not authenticated"
                )));
            }
        }
        self.store.insert_job(&job).await?;
        self.bus.publish(Event::StatusChange {
            job_id: job.id.clone(),
            status: job.status,
            at: job.created_at,
        });
        Ok(job)
    }

    /// Schedules a worker and returns once it has been spawned.
    pub async fn start(&self, job_id: &JobId) -> EngineResult<()> {
        let mut running = self.running.lock().await;
        if running.contains_key(job_id) {
            return Ok(());
        }

        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;
        if matches!(job.status, JobStatus::Completed) {
            return Err(EngineError::internal("job already completed"));
        }

        let stop = StopFlag::new();
        let worker = ForwardingWorker::new(
            job_id.clone(),
            self.store.clone(),
            self.pool.clone(),
            self.bus.clone(),
            stop.clone(),
        );
        let job_id_for_log = job_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = worker.run().await {
                error!(job_id = %job_id_for_log, %err, "worker exited with an unrecovered error");
            }
        });

        running.insert(job_id.clone(), RunningWorker { stop, handle });
        Ok(())
    }

    /// Synchronous stop: requests the cooperative stop and waits for the
    /// worker to acknowledge shutdown before returning.
    pub async fn stop(&self, job_id: &JobId) -> EngineResult<()> {
        let worker = self.running.lock().await.remove(job_id);
        if let Some(worker) = worker {
            worker.stop.request_stop();
            let _ = worker.handle.await;
        }
        Ok(())
    }

    /// Stop (if running) then remove the durable record: a delete on a
    /// running job implies stop first, then record removal after the
    /// worker acknowledges shutdown.
    pub async fn delete(&self, job_id: &JobId) -> EngineResult<()> {
        self.stop(job_id).await?;
        self.store.delete_job(job_id).await?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &JobId) -> EngineResult<Option<Job>> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn list_jobs(&self) -> EngineResult<Vec<Job>> {
        Ok(self.store.list_jobs().await?)
    }

    pub async fn stats(&self) -> EngineResult<Stats> {
        let jobs = self.store.list_jobs().await?;
        let accounts = self.store.list_accounts().await?;

        let mut stats = Stats {
            pending: 0,
            running: 0,
            paused: 0,
            completed: 0,
            failed: 0,
            stopped: 0,
            accounts_connected: accounts.iter().filter(|a| a.is_usable()).count() as u32,
            total_messages_delivered: 0,
        };

        for job in &jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Stopped => stats.stopped += 1,
            }
            let cursor = self.store.load_cursor(&job.id).await?;
            stats.total_messages_delivered += cursor.delivered.len() as u64;
        }

        Ok(stats)
    }
}
