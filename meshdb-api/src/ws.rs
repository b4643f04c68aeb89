//! WebSocket event feed: every store mutation, local or replicated, pushed
//! to connected clients as one JSON frame.

use crate::server::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use meshdb_core::Document;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct EventFrame<'a> {
    #[serde(rename = "type")]
    kind: String,
    collection: &'a str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    document: Option<&'a Document>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let events = state.store.subscribe_events();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

async fn handle_socket(
    mut socket: WebSocket,
    mut events: broadcast::Receiver<meshdb_store::StoreEvent>,
) {
    debug!("websocket client connected");
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "websocket client lagged; events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let frame = EventFrame {
                    kind: event.op.to_string(),
                    collection: &event.collection,
                    id: &event.id,
                    document: event.document.as_ref(),
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize event frame");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Clients only listen; anything but close is ignored.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!("websocket client disconnected");
}
