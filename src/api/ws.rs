//! Progress WebSocket endpoint (spec §4.6).
//!
//! A plain `axum::extract::ws` upgrade forwarding `ProgressBroadcaster`
//! events as `ffmpeg-progress`/`job-deleted` JSON frames — generalized
//! from the teacher's GraphQL-subscription websocket to a single
//! broadcast-backed channel with no query language on top.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tracing::debug;

use crate::AppState;

async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward(socket, state))
}

async fn forward(mut socket: WebSocket, state: AppState) {
    let mut rx = state.broadcaster.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let message = match event {
                    Ok(message) => message,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "progress websocket lagged, dropping oldest frames");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let Ok(payload) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/progress", get(handler))
}
