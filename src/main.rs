//! Bin entry point: wires the engine to its SQLite store and axum
//! HTTP+WebSocket surface.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use forwarding_engine::config::CONFIG;
use forwarding_engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    tracing::info!(
        database_url = %CONFIG.database_url,
        bind_address = %CONFIG.bind_address(),
        "starting forwarding engine"
    );

    let engine = std::sync::Arc::new(Engine::bootstrap(&CONFIG).await?);
    let app = forwarding_engine::api::router(engine);

    let listener = tokio::net::TcpListener::bind(CONFIG.bind_address()).await?;
    tracing::info!(addr = %CONFIG.bind_address(), "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
