//! HTTP + WebSocket control surface. This crate's engine is a
//! library; this module is the thin axum collaborator that exercises it —
//! unauthenticated, for driving the engine end-to-end, not a production
//! control plane.

pub mod error;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Root router: job/account/stats REST endpoints plus the `/ws` event feed.
pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(http::router())
        .nest("/ws", ws::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
