//! Integration tests driving the full `JobSupervisor` against an
//! in-memory SQLite store and `FakeTransport` accounts, covering the
//! end-to-end scenarios the unit tests colocated with individual modules
//! don't already exercise.

use std::sync::Arc;
use std::time::Duration;

use forwarding_engine::bus::ObserverBus;
use forwarding_engine::domain::{
    Account, AccountStatus, ChatRef, Entity, EntityKind, FilterPolicy, Job, JobStatus, RateParams,
};
use forwarding_engine::governor::RateGovernor;
use forwarding_engine::pool::AccountPool;
use forwarding_engine::store::SqliteStore;
use forwarding_engine::supervisor::JobSupervisor;
use forwarding_engine::transport::fake::{text_message, FakeTransport, FakeWorld};

async fn authenticated_account(store: &SqliteStore, id: &str) {
    let mut account = Account::new(id.to_string(), 1, "hash".into(), None);
    account.status = AccountStatus::Authenticated;
    store.upsert_account(&account).await.unwrap();
}

/// Scenario 4: a process crash after message 500 is acknowledged but
/// before the job's status is flushed back to something other than
/// `running` leaves the store with last_id/delivered already advanced.
/// Recovery must never discard that progress, only demote the job so a
/// human restarts it explicitly.
#[tokio::test]
async fn crash_before_status_flush_preserves_delivered_progress() {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    authenticated_account(&store, "acc1").await;

    let mut job = Job::new(
        "job1".into(),
        "test".into(),
        ChatRef::Id(1),
        ChatRef::Id(2),
        vec!["acc1".into()],
        FilterPolicy::text_only(),
        RateParams::default(),
    );
    job.status = JobStatus::Running;
    store.insert_job(&job).await.unwrap();

    // Simulate the in-flight state right after message 500 was
    // acknowledged: delivered advances, but the process dies before
    // anything else observes it.
    store.append(&job.id, Some(500), 500).await.unwrap();

    let pool = Arc::new(AccountPool::new(Arc::new(RateGovernor::new())));
    let bus = ObserverBus::new(64);
    let supervisor = JobSupervisor::new(store.clone(), pool, bus);

    // A fresh supervisor standing in for the restarted process.
    supervisor.recover().await.unwrap();

    let reloaded = supervisor.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, JobStatus::Pending);

    let cursor = store.load_cursor(&job.id).await.unwrap();
    assert_eq!(cursor.last_id, 500);
    assert!(cursor.delivered.contains(&500));
}

/// Scenario 5: a job targeting a broadcast channel whose `linked_chat_id`
/// points at a forum supergroup must redirect every send to that
/// supergroup (with topic 1), never attempting a send on the broadcast
/// channel itself.
#[tokio::test]
async fn broadcast_target_redirects_to_linked_forum() {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    authenticated_account(&store, "acc1").await;

    let pool = Arc::new(AccountPool::new(Arc::new(RateGovernor::new())));
    let world = FakeWorld::new();
    pool.register("acc1".into(), Arc::new(FakeTransport::new("acc1", world.clone())))
        .await;

    let source = Entity {
        id: 1,
        title: "source".into(),
        kind: EntityKind::Group,
        is_forum: false,
        linked_chat_id: None,
    };
    let broadcast = Entity {
        id: 2,
        title: "announcements".into(),
        kind: EntityKind::BroadcastChannel,
        is_forum: false,
        linked_chat_id: Some(3),
    };
    let linked_forum = Entity {
        id: 3,
        title: "discussion".into(),
        kind: EntityKind::Supergroup,
        is_forum: true,
        linked_chat_id: None,
    };
    world.register_entity(ChatRef::Id(1), source);
    world.register_entity(ChatRef::Id(2), broadcast);
    world.register_entity(ChatRef::Id(3), linked_forum);
    world.seed_messages(1, vec![text_message(1, "announcement")]);

    let bus = ObserverBus::new(64);
    let supervisor = JobSupervisor::new(store.clone(), pool, bus);
    let job = Job::new(
        "job1".into(),
        "test".into(),
        ChatRef::Id(1),
        ChatRef::Id(2),
        vec!["acc1".into()],
        FilterPolicy::all_media(),
        RateParams {
            inter_message_delay_secs: 0.01,
            max_messages_per_minute: 1000,
        },
    );
    let job = supervisor.create_job(job).await.unwrap();
    supervisor.start(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = world.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target_entity_id, 3, "must redirect to the linked forum, not the broadcast channel");
    assert_eq!(sent[0].topic_id, Some(1));

    let reloaded = supervisor.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, JobStatus::Completed);
}

/// Scenario 6: stopping mid-run persists the cursor at the current point
/// and marks the job Stopped; restarting the same job resumes exactly at
/// `last_id` rather than replaying already-accounted-for messages.
#[tokio::test]
async fn stop_then_restart_resumes_from_last_id() {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    authenticated_account(&store, "acc1").await;

    let pool = Arc::new(AccountPool::new(Arc::new(RateGovernor::new())));
    let world = FakeWorld::new();
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
    world.seed_messages(1, vec![text_message(5, "first")]);

    let bus = ObserverBus::new(64);
    let supervisor = JobSupervisor::new(store.clone(), pool.clone(), bus.clone());
    let job = Job::new(
        "job1".into(),
        "test".into(),
        ChatRef::Id(1),
        ChatRef::Id(1),
        vec!["acc1".into()],
        FilterPolicy::all_media(),
        RateParams::default(),
    );
    let job = supervisor.create_job(job).await.unwrap();

    supervisor.start(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.stop(&job.id).await.unwrap();

    let reloaded = supervisor.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, JobStatus::Stopped);

    let cursor = store.load_cursor(&job.id).await.unwrap();
    assert_eq!(cursor.last_id, 5);

    // Seed a second, later message and restart: only the new message
    // should be sent, never message 5 again.
    world.seed_messages(1, vec![text_message(6, "second")]);
    supervisor.start(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sent = world.sent();
    assert_eq!(sent.len(), 1, "message 5 must not be re-sent after restart");

    let reloaded = supervisor.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, JobStatus::Completed);
    let cursor = store.load_cursor(&job.id).await.unwrap();
    assert_eq!(cursor.last_id, 6);
}
