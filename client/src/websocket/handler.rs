//! WebSocket connection handling.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::app::AppState;
use crate::bus::Subscription;
use crate::websocket::{ClientMessage, MessageSender, ServerMessage};

/// Handle an established WebSocket connection.
///
/// Outgoing messages go through a per-connection channel drained by a
/// writer task; bus callbacks only ever push into that channel. Every
/// subscription made on the connection is dropped when it closes.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = state.conn_manager.register(tx.clone());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    // Let the screen render the indicator straight away.
    let _ = tx.send(ServerMessage::sync_status(state.service.sync_status()));

    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &state, &tx, &mut subscriptions);
                state.conn_manager.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    let dropped = subscriptions.len();
    drop(subscriptions);
    state.conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        subscriptions = dropped,
        active_connections = state.conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply.
fn process_message(
    text: &str,
    state: &AppState,
    tx: &MessageSender,
    subscriptions: &mut HashMap<String, Subscription>,
) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Subscribe { filter, request_id } => {
            let subscription_id = uuid::Uuid::new_v4().to_string();
            let sender = tx.clone();
            let id = subscription_id.clone();
            let subscription = state.service.subscribe(filter, move |event| {
                let _ = sender.send(ServerMessage::Event {
                    subscription_id: id.clone(),
                    event: event.clone(),
                });
            });
            subscriptions.insert(subscription_id.clone(), subscription);
            tracing::debug!(subscription_id = %subscription_id, "WebSocket subscription added");
            ServerMessage::Subscribed {
                subscription_id,
                request_id,
            }
        }

        ClientMessage::Unsubscribe {
            subscription_id,
            request_id,
        } => match subscriptions.remove(&subscription_id) {
            Some(mut subscription) => {
                subscription.unsubscribe();
                ServerMessage::Unsubscribed {
                    subscription_id,
                    request_id,
                }
            }
            None => ServerMessage::error(
                format!("Unknown subscription: {}", subscription_id),
                request_id,
            ),
        },

        ClientMessage::Status { request_id } => ServerMessage::SyncStatus {
            state: state.service.sync_status(),
            request_id,
        },

        ClientMessage::Ping => ServerMessage::Pong,
    }
}
