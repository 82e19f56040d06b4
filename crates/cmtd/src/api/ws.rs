//! WebSocket event streaming

use super::ApiState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// WebSocket upgrade handler
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Stream controller events to one client until either side closes.
async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>) {
    info!("websocket client connected");

    let mut events = state.power.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("websocket client lagging, dropped {} events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("websocket client closed");
                        break;
                    }
                    Some(Ok(_)) => {} // keepalives and pings are ignored
                    Some(Err(e)) => {
                        warn!("websocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    info!("websocket client disconnected");
}
