//! Live event feed: upgrades to a WebSocket and forwards every `Event`
//! published on the `ObserverBus` as a JSON text frame. Read-only from
//! the client's perspective — there is no request/response half.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::bus::Event;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.engine.bus.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(mut socket: WebSocket, mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(%err, "failed to serialize event for ws subscriber");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    debug!("ws subscriber disconnected");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "ws subscriber lagged, events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
