//! Forwarding Worker: the per-job state machine driving
//! fetch → filter → dispatch → record → checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use tracing::{info, instrument, warn};

use crate::bus::{Event, ObserverBus};
use crate::domain::{
    AccountId, AccountStatus, ChatRef, Entity, EntityKind, Job, JobId, JobStatus, LogEntry,
    LogLevel, ProgressCursor,
};
use crate::error::{EngineError, EngineResult, TransportError};
use crate::filter::{self, Decision};
use crate::governor::{dynamic_delay, Acquired};
use crate::pool::AccountPool;
use crate::store::SqliteStore;
use crate::transport::{MessageKind, SourceMessage, Transport};

/// Transient-error retries allowed per message, counted across accounts.
const TRANSIENT_RETRY_LIMIT: u32 = 3;

/// Consecutive per-message failures that fail the job.
const CONSECUTIVE_FAILURE_LIMIT: u32 = 5;

/// Cumulative, in-memory-only per-job counters behind the stats snapshot:
/// recomputed on every progress publish, never persisted on their own —
/// the Progress Cursor is the durable source of truth for
/// `delivered_count`/`last_id`.
#[derive(Default)]
struct JobCounters {
    sent: u64,
    skipped: u64,
    failed: u64,
}

impl JobCounters {
    fn progress_event(
        &self,
        job_id: JobId,
        last_id: i64,
        delivered_count: usize,
        elapsed: std::time::Duration,
    ) -> Event {
        let attempted = self.sent + self.failed;
        let success_rate = if attempted == 0 { 1.0 } else { self.sent as f64 / attempted as f64 };
        let error_rate = if attempted == 0 { 0.0 } else { self.failed as f64 / attempted as f64 };
        let minutes = (elapsed.as_secs_f64() / 60.0).max(1.0 / 60.0);
        Event::Progress {
            job_id,
            last_id,
            delivered_count,
            skipped_count: self.skipped as usize,
            failed_count: self.failed as usize,
            success_rate,
            error_rate,
            messages_per_minute: self.sent as f64 / minutes,
        }
    }
}

/// Cooperative stop signal shared with whoever started the worker.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ForwardingWorker {
    job_id: JobId,
    store: Arc<SqliteStore>,
    pool: Arc<AccountPool>,
    bus: ObserverBus,
    stop: StopFlag,
}

impl ForwardingWorker {
    pub fn new(
        job_id: JobId,
        store: Arc<SqliteStore>,
        pool: Arc<AccountPool>,
        bus: ObserverBus,
        stop: StopFlag,
    ) -> Self {
        Self {
            job_id,
            store,
            pool,
            bus,
            stop,
        }
    }

    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub async fn run(self) -> EngineResult<()> {
        let mut job = self
            .store
            .get_job(&self.job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))?;

        let mut cursor = self.store.load_cursor(&self.job_id).await?;
        if job.reset_progress {
            cursor.reset();
            self.store.reset_cursor(&self.job_id).await?;
        }

        let transport = match self.any_transport(&job.account_ids).await {
            Ok(t) => t,
            Err(_) => {
                self.fail(&mut job, "no connected account available").await?;
                return Ok(());
            }
        };

        let source_entity = match transport.resolve_entity(&job.source_ref).await {
            Ok(e) => e,
            Err(err) => {
                self.fail(&mut job, &format!("source resolution failed: {err}")).await?;
                return Ok(());
            }
        };
        let (target_entity, topic_id) =
            match self.resolve_effective_target(&transport, &job.target_ref).await {
                Ok(pair) => pair,
                Err(err) => {
                    self.fail(&mut job, &format!("target resolution failed: {err}")).await?;
                    return Ok(());
                }
            };

        self.preflight(&job, &target_entity, topic_id).await;

        self.transition(&mut job, JobStatus::Running).await?;

        let cycle = self.pool.cycle(self.job_id.clone(), job.account_ids.clone());
        let mut consecutive_successes: u32 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut counters = JobCounters::default();
        let started = Instant::now();

        loop {
            if self.stop.is_set() {
                return self.stop_now(&mut job, &cursor).await;
            }

            let batch_size = rand::rng().random_range(5..=15usize);
            let window = match transport
                .fetch_window(&source_entity, cursor.last_id, batch_size)
                .await
            {
                Ok(w) => w,
                Err(err) => {
                    self.fail(&mut job, &format!("fetch failed: {err}")).await?;
                    return Ok(());
                }
            };

            if window.is_empty() {
                self.transition(&mut job, JobStatus::Completed).await?;
                self.bus.publish(Event::Completed {
                    job_id: self.job_id.clone(),
                });
                return Ok(());
            }

            for message in window {
                if self.stop.is_set() {
                    return self.stop_now(&mut job, &cursor).await;
                }

                if message.id <= cursor.last_id || cursor.delivered.contains(&message.id) {
                    continue;
                }

                let decision = filter::classify(&message, &job.filter_policy);
                if decision == Decision::Drop {
                    cursor.last_id = message.id;
                    counters.skipped += 1;
                    self.store.append(&self.job_id, None, cursor.last_id).await?;
                    self.log(LogLevel::Info, format!("skipped message {}", message.id)).await?;
                    continue;
                }

                let mut transient_attempts = 0u32;
                loop {
                    if self.stop.is_set() {
                        return self.stop_now(&mut job, &cursor).await;
                    }

                    let account_id = match cycle.next_eligible().await {
                        Some(id) => id,
                        None => {
                            self.fail(&mut job, "no eligible account remaining").await?;
                            return Ok(());
                        }
                    };

                    match self
                        .pool
                        .governor()
                        .acquire(&account_id, job.rate_params.max_messages_per_minute)
                        .await
                    {
                        Acquired::Wait(d) => {
                            tokio::time::sleep(d).await;
                            continue;
                        }
                        Acquired::Granted => {}
                    }

                    let Some(account_transport) = self.pool.get_handle(&account_id).await else {
                        self.pool
                            .mark_unhealthy(&self.job_id, &account_id, "handle disappeared")
                            .await;
                        continue;
                    };
                    let send_lock = self.pool.send_lock(&account_id).await;

                    let result = {
                        let _guard = match &send_lock {
                            Some(lock) => Some(lock.lock().await),
                            None => None,
                        };
                        dispatch(&account_transport, &target_entity, topic_id, &message, decision).await
                    };

                    match result {
                        Ok(_ack) => {
                            cursor.delivered.insert(message.id);
                            cursor.last_id = message.id;
                            counters.sent += 1;
                            self.store
                                .append(&self.job_id, Some(message.id), cursor.last_id)
                                .await?;
                            self.bus.publish(counters.progress_event(
                                self.job_id.clone(),
                                cursor.last_id,
                                cursor.delivered.len(),
                                started.elapsed(),
                            ));
                            consecutive_successes += 1;
                            consecutive_failures = 0;
                            let delay = dynamic_delay(
                                job.rate_params.inter_message_delay_secs,
                                consecutive_successes,
                                false,
                            );
                            tokio::time::sleep(delay).await;
                            break;
                        }
                        Err(TransportError::FloodWait(seconds)) => {
                            self.pool.governor().note_flood_wait(&account_id, seconds).await;
                            self.bus.publish(Event::FloodWait {
                                job_id: self.job_id.clone(),
                                account_id,
                                seconds,
                            });
                            continue;
                        }
                        Err(TransportError::WritePermissionDenied) => {
                            self.pool
                                .mark_unhealthy(&self.job_id, &account_id, "write permission denied")
                                .await;
                            continue;
                        }
                        Err(TransportError::NotAuthorized) => {
                            self.pool
                                .mark_unhealthy(&self.job_id, &account_id, "session no longer authorized")
                                .await;
                            self.disconnect_account(&account_id).await;
                            continue;
                        }
                        Err(TransportError::NotFound) | Err(TransportError::PrivateForbidden) => {
                            self.fail(&mut job, "target became unreachable mid-run").await?;
                            return Ok(());
                        }
                        Err(err @ (TransportError::Transient(_) | TransportError::Unexpected(_))) => {
                            transient_attempts += 1;
                            if transient_attempts >= TRANSIENT_RETRY_LIMIT {
                                consecutive_failures += 1;
                                consecutive_successes = 0;
                                counters.failed += 1;
                                cursor.last_id = message.id;
                                self.store.append(&self.job_id, None, cursor.last_id).await?;
                                self.log(
                                    LogLevel::Error,
                                    format!("message {} failed after retries: {err}", message.id),
                                )
                                .await?;
                                if consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
                                    job.last_error =
                                        Some(format!("{CONSECUTIVE_FAILURE_LIMIT} consecutive failures: {err}"));
                                    self.transition(&mut job, JobStatus::Failed).await?;
                                    return Ok(());
                                }
                                break;
                            }
                            continue;
                        }
                    }
                }
            }
        }
    }

    async fn any_transport(&self, account_ids: &[AccountId]) -> EngineResult<Arc<dyn Transport>> {
        for id in account_ids {
            if let Some(t) = self.pool.get_handle(id).await {
                return Ok(t);
            }
        }
        Err(EngineError::NoEligibleAccount)
    }

    /// Pre-flight: a real test send against the effective target for every
    /// assigned account, marking permission failures unhealthy for this job
    /// only. This genuinely delivers a message into the target chat —
    /// surprising, but reproduced here deliberately (see DESIGN.md).
    async fn preflight(&self, job: &Job, target: &Entity, topic_id: Option<i64>) {
        warn!(job_id = %self.job_id, "pre-flight test sends deliver a real message into the target");
        for account_id in &job.account_ids {
            let Some(transport) = self.pool.get_handle(account_id).await else {
                continue;
            };
            let result = transport.send_text(target, "", topic_id).await;
            if let Err(TransportError::WritePermissionDenied | TransportError::NotAuthorized) = result {
                self.pool
                    .mark_unhealthy(&self.job_id, account_id, "pre-flight send failed")
                    .await;
            }
        }
    }

    /// Resolve the target, substituting the linked forum group for a
    /// broadcast channel.
    async fn resolve_effective_target(
        &self,
        transport: &Arc<dyn Transport>,
        target_ref: &ChatRef,
    ) -> Result<(Entity, Option<i64>), TransportError> {
        let target_entity = transport.resolve_entity(target_ref).await?;
        if target_entity.kind == EntityKind::BroadcastChannel {
            if let Some(linked_id) = target_entity.linked_chat_id {
                let linked = transport.resolve_entity(&ChatRef::Id(linked_id)).await?;
                if linked.is_forum {
                    let topic_id = linked.topic_id();
                    return Ok((linked, topic_id));
                }
            }
        }
        let topic_id = target_entity.topic_id();
        Ok((target_entity, topic_id))
    }

    async fn disconnect_account(&self, account_id: &AccountId) {
        if let Ok(Some(mut account)) = self.store.get_account(account_id).await {
            account.status = AccountStatus::Disconnected;
            let _ = self.store.upsert_account(&account).await;
        }
    }

    async fn transition(&self, job: &mut Job, status: JobStatus) -> EngineResult<()> {
        job.transition(status);
        self.store.update_job(job).await?;
        self.bus.publish(Event::StatusChange {
            job_id: self.job_id.clone(),
            status,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn fail(&self, job: &mut Job, reason: &str) -> EngineResult<()> {
        job.last_error = Some(reason.to_string());
        self.log(LogLevel::Error, reason.to_string()).await?;
        self.transition(job, JobStatus::Failed).await
    }

    async fn stop_now(&self, job: &mut Job, cursor: &ProgressCursor) -> EngineResult<()> {
        self.store.append(&self.job_id, None, cursor.last_id).await?;
        self.transition(job, JobStatus::Stopped).await?;
        info!(job_id = %self.job_id, "worker stopped on cooperative signal");
        Ok(())
    }

    async fn log(&self, level: LogLevel, message: String) -> EngineResult<()> {
        let entry = LogEntry::new(self.job_id.clone(), level, message);
        self.store.append_log(&entry).await?;
        self.bus.publish(Event::Log {
            job_id: self.job_id.clone(),
            entry,
        });
        Ok(())
    }
}

async fn dispatch(
    transport: &Arc<dyn Transport>,
    target: &Entity,
    topic_id: Option<i64>,
    message: &SourceMessage,
    decision: Decision,
) -> Result<crate::transport::Ack, TransportError> {
    match (&message.kind, decision) {
        (MessageKind::TextOnly { text }, Decision::ForwardAsText) => {
            transport.send_text(target, text, topic_id).await
        }
        (MessageKind::Photo { media, caption }, Decision::ForwardAsMedia) => {
            transport
                .send_file(target, media, caption.as_deref().unwrap_or(""), topic_id)
                .await
        }
        (MessageKind::Document { media, caption, .. }, Decision::ForwardAsMedia) => {
            transport
                .send_file(target, media, caption.as_deref().unwrap_or(""), topic_id)
                .await
        }
        _ => Err(TransportError::Unexpected(
            "filter decision incompatible with message kind".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Account, AccountStatus, FilterKind, FilterPolicy, RateParams};
    use crate::pool::AccountPool;
    use crate::governor::RateGovernor;
    use crate::store::SqliteStore;
    use crate::transport::fake::{document_message, photo_message, text_message, FakeTransport, FakeWorld};

    async fn harness() -> (Arc<SqliteStore>, Arc<AccountPool>, ObserverBus, FakeWorld) {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let governor = Arc::new(RateGovernor::new());
        let pool = Arc::new(AccountPool::new(governor));
        let bus = ObserverBus::new(64);
        let world = FakeWorld::new();
        (store, pool, bus, world)
    }

    async fn authenticated_account(store: &SqliteStore, id: &str) -> Account {
        let mut account = Account::new(id.to_string(), 1, "hash".into(), None);
        account.status = AccountStatus::Authenticated;
        store.upsert_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn text_only_policy_sends_only_text_and_completes() {
        let (store, pool, bus, world) = harness().await;
        authenticated_account(&store, "acc1").await;
        pool.register("acc1".into(), Arc::new(FakeTransport::new("acc1", world.clone())))
            .await;

        let source = Entity {
            id: 1,
            title: "source".into(),
            kind: EntityKind::Group,
            is_forum: false,
            linked_chat_id: None,
        };
        let target = Entity {
            id: 2,
            title: "target".into(),
            kind: EntityKind::Group,
            is_forum: false,
            linked_chat_id: None,
        };
        world.register_entity(ChatRef::Id(1), source.clone());
        world.register_entity(ChatRef::Id(2), target.clone());
        world.seed_messages(
            1,
            vec![
                text_message(11, "hello"),
                photo_message(10),
                photo_message(12),
                text_message(13, "world"),
            ],
        );

        let job = Job::new(
            "job1".into(),
            "test".into(),
            ChatRef::Id(1),
            ChatRef::Id(2),
            vec!["acc1".into()],
            FilterPolicy {
                kinds: [FilterKind::TextOnly].into_iter().collect(),
                extensions: Default::default(),
            },
            RateParams::default(),
        );
        store.insert_job(&job).await.unwrap();

        let worker = ForwardingWorker::new(
            job.id.clone(),
            store.clone(),
            pool.clone(),
            bus.clone(),
            StopFlag::new(),
        );
        worker.run().await.unwrap();

        let reloaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);

        let cursor = store.load_cursor(&job.id).await.unwrap();
        assert_eq!(cursor.last_id, 13);
        assert_eq!(cursor.delivered, [11, 13].into_iter().collect());

        let sent = world.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|r| !r.as_media));
    }

    #[tokio::test]
    async fn flood_wait_fails_over_to_second_account() {
        let (store, pool, bus, world) = harness().await;
        authenticated_account(&store, "acc1").await;
        authenticated_account(&store, "acc2").await;
        pool.register("acc1".into(), Arc::new(FakeTransport::new("acc1", world.clone())))
            .await;
        pool.register("acc2".into(), Arc::new(FakeTransport::new("acc2", world.clone())))
            .await;

        let entity = Entity {
            id: 1,
            title: "chat".into(),
            kind: EntityKind::Group,
            is_forum: false,
            linked_chat_id: None,
        };
        world.register_entity(ChatRef::Id(1), entity.clone());
        world.seed_messages(1, vec![text_message(42, "hi")]);
        world.arm_flood_wait("acc1", 0);

        let job = Job::new(
            "job1".into(),
            "test".into(),
            ChatRef::Id(1),
            ChatRef::Id(1),
            vec!["acc1".into(), "acc2".into()],
            FilterPolicy::all_media(),
            RateParams {
                inter_message_delay_secs: 0.01,
                max_messages_per_minute: 1000,
            },
        );
        store.insert_job(&job).await.unwrap();

        let worker = ForwardingWorker::new(
            job.id.clone(),
            store.clone(),
            pool.clone(),
            bus.clone(),
            StopFlag::new(),
        );
        worker.run().await.unwrap();

        let sent = world.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].account_id, "acc2");

        let reloaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn forum_topic_id_is_applied_to_sends() {
        let (store, pool, bus, world) = harness().await;
        authenticated_account(&store, "acc1").await;
        pool.register("acc1".into(), Arc::new(FakeTransport::new("acc1", world.clone())))
            .await;

        let source = Entity {
            id: 1,
            title: "source".into(),
            kind: EntityKind::Group,
            is_forum: false,
            linked_chat_id: None,
        };
        let target = Entity {
            id: 2,
            title: "forum target".into(),
            kind: EntityKind::Supergroup,
            is_forum: true,
            linked_chat_id: None,
        };
        world.register_entity(ChatRef::Id(1), source);
        world.register_entity(ChatRef::Id(2), target);
        world.seed_messages(1, vec![text_message(1, "hi")]);

        let job = Job::new(
            "job1".into(),
            "test".into(),
            ChatRef::Id(1),
            ChatRef::Id(2),
            vec!["acc1".into()],
            FilterPolicy::all_media(),
            RateParams::default(),
        );
        store.insert_job(&job).await.unwrap();

        let worker = ForwardingWorker::new(job.id.clone(), store, pool, bus, StopFlag::new());
        worker.run().await.unwrap();

        let sent = world.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic_id, Some(1));
    }

    #[tokio::test]
    async fn stop_flag_halts_before_next_batch() {
        let (store, pool, bus, world) = harness().await;
        authenticated_account(&store, "acc1").await;
        pool.register("acc1".into(), Arc::new(FakeTransport::new("acc1", world.clone())))
            .await;

        let entity = Entity {
            id: 1,
            title: "chat".into(),
            kind: EntityKind::Group,
            is_forum: false,
            linked_chat_id: None,
        };
        world.register_entity(ChatRef::Id(1), entity);

        let job = Job::new(
            "job1".into(),
            "test".into(),
            ChatRef::Id(1),
            ChatRef::Id(1),
            vec!["acc1".into()],
            FilterPolicy::all_media(),
            RateParams::default(),
        );
        store.insert_job(&job).await.unwrap();

        let stop = StopFlag::new();
        stop.request_stop();
        let worker = ForwardingWorker::new(job.id.clone(), store.clone(), pool, bus, stop);
        worker.run().await.unwrap();

        let reloaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Stopped);
    }

    // silence "unused import" for document_message in builds where no test exercises it directly
    #[allow(dead_code)]
    fn _touch() {
        let _ = document_message(0, "application/pdf", None);
    }
}
