//! WebSocket Connection Handler
//!
//! Adapts socket events to the gateway orchestrator: connection-open on
//! upgrade, one identify frame before anything else, then envelopes until
//! the socket closes.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use super::messages::{Envelope, OutboundFrame};
use crate::shared::error::ErrorCode;
use crate::startup::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    tracing::debug!(conn_id = %conn_id, "New WebSocket connection");

    // Split socket for concurrent read/write
    let (mut sender, mut receiver) = socket.split();

    // Channel feeding the socket writer task
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    // Spawn task to forward frames from channel to WebSocket
    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    if !state.service.connection_open(conn_id, tx.clone()) {
        tracing::error!(conn_id = %conn_id, "Connection id collision; dropping socket");
        sender_task.abort();
        return;
    }

    // Wait for the identify frame (with timeout)
    let identify_timeout = Duration::from_secs(state.service.settings().identify_timeout_secs);
    let identify_result = timeout(identify_timeout, async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<Envelope>(&text) {
                        Ok(Envelope::Identify { user_id }) => return Some(user_id),
                        Ok(_) | Err(_) => {
                            // Anything before identify is rejected; the
                            // client must authenticate first.
                            let _ = tx.send(OutboundFrame::error(ErrorCode::InvalidUserId));
                        }
                    }
                }
                Ok(Message::Close(_)) => return None,
                Err(_) => return None,
                _ => continue,
            }
        }
        None
    })
    .await;

    let raw_user_id = match identify_result {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            tracing::debug!(conn_id = %conn_id, "Connection closed before identify");
            state.service.connection_close(conn_id).await;
            sender_task.abort();
            return;
        }
        Err(_) => {
            tracing::debug!(conn_id = %conn_id, "Identify timeout");
            let _ = tx.send(OutboundFrame::error(ErrorCode::InvalidUserId));
            tokio::time::sleep(Duration::from_millis(100)).await;
            state.service.connection_close(conn_id).await;
            sender_task.abort();
            return;
        }
    };

    let user_id = match state.service.identify(conn_id, &raw_user_id) {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::debug!(conn_id = %conn_id, error = %err, "Identify rejected");
            let _ = tx.send(OutboundFrame::from_error(&err));
            tokio::time::sleep(Duration::from_millis(100)).await;
            state.service.connection_close(conn_id).await;
            sender_task.abort();
            return;
        }
    };

    // Main message loop
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_text(&state, conn_id, user_id, &text).await;
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(conn_id = %conn_id, "Connection closed");
                break;
            }
            Ok(Message::Ping(_)) => {
                // Pong is handled automatically by axum
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup: synchronously drop the connection from all local indices so
    // no further writes target the dead socket.
    state.service.connection_close(conn_id).await;
    sender_task.abort();

    tracing::info!(conn_id = %conn_id, user_id = %user_id, "Connection closed and cleaned up");
}

/// Top of the per-message path: parse, dispatch, and convert anything
/// unexpected into a coded error frame. A single malformed or unlucky
/// message must never crash the process.
async fn handle_text(state: &AppState, conn_id: Uuid, user_id: Uuid, text: &str) {
    let envelope = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(conn_id = %conn_id, error = %err, "Malformed envelope");
            state
                .service
                .registry()
                .send_to(conn_id, OutboundFrame::error(ErrorCode::MessageProcessingFailed));
            return;
        }
    };

    if let Err(err) = state.service.handle_envelope(conn_id, user_id, envelope).await {
        tracing::debug!(conn_id = %conn_id, error = %err, "Envelope rejected");
        state
            .service
            .registry()
            .send_to(conn_id, OutboundFrame::from_error(&err));
    }
}
