//! Forwarding engine: a multi-account message-forwarding scheduler with
//! rate limiting, durable persistence, and pub/sub observability.
//!
//! The crate is organized around the engine's major components: a
//! `Transport` capability boundary, a durable `store`, a per-account
//! `governor`, an `Account Pool`, a pure `filter`, a `ForwardingWorker`
//! state machine, a `JobSupervisor` lifecycle manager, and an `ObserverBus`
//! for pub/sub. `api` exposes all of it over HTTP and WebSocket.

pub mod api;
pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod filter;
pub mod governor;
pub mod pool;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod worker;

use std::sync::Arc;

use tracing::info;

use crate::bus::ObserverBus;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::governor::RateGovernor;
use crate::pool::AccountPool;
use crate::store::SqliteStore;
use crate::supervisor::JobSupervisor;

/// Everything a running engine needs, assembled once at process start and
/// shared (via `Arc`) with the HTTP/WS surface.
pub struct Engine {
    pub store: Arc<SqliteStore>,
    pub pool: Arc<AccountPool>,
    pub bus: ObserverBus,
    pub supervisor: Arc<JobSupervisor>,
}

impl Engine {
    /// Connect the store, run migrations, and recover any job left in
    /// `running` by a prior process.
    pub async fn bootstrap(config: &EngineConfig) -> EngineResult<Self> {
        let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
        let governor = Arc::new(RateGovernor::new());
        let pool = Arc::new(AccountPool::new(governor));
        let bus = ObserverBus::new(config.observer_backlog);
        let supervisor = Arc::new(JobSupervisor::new(store.clone(), pool.clone(), bus.clone()));

        supervisor.recover().await?;
        info!("engine bootstrapped");

        Ok(Self {
            store,
            pool,
            bus,
            supervisor,
        })
    }
}
