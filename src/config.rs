// src/config.rs
// Central configuration for the forwarding engine

use once_cell::sync::Lazy;

/// Global, process-wide configuration loaded once from the environment.
pub static CONFIG: Lazy<EngineConfig> = Lazy::new(EngineConfig::from_env);

/// Typed configuration for the engine and its bundled HTTP/WS surface.
///
/// The engine itself only consumes `database_url`, `observer_backlog`, and
/// `max_concurrent_jobs`; `host`/`port` belong to the HTTP collaborator
/// but are kept here because this crate's `bin` wires both.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub max_concurrent_jobs: usize,
    pub observer_backlog: usize,
    pub default_rate: crate::domain::RateParams,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://forwarding_engine.db".to_string());
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let max_concurrent_jobs = std::env::var("MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let observer_backlog = std::env::var("OBSERVER_BACKLOG")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(256);

        Self {
            database_url,
            host,
            port,
            max_concurrent_jobs,
            observer_backlog,
            default_rate: crate::domain::RateParams::default(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
