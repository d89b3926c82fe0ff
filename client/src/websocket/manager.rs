//! Registry of open kiosk screen connections.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rollcall_engine::SyncState;
use tokio::sync::mpsc;

use super::ServerMessage;

/// Outgoing half of a screen connection.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub opened_at: DateTime<Utc>,
    pub sender: MessageSender,
}

/// Open connections keyed by a generated id. Shared between handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
}

impl ConnectionManager {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, sender: MessageSender) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                opened_at: Utc::now(),
                sender,
            },
        );
        tracing::info!(conn_id = %id, screens = self.connections.len(), "screen connected");
        id
    }

    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            let open_for = Utc::now() - conn.opened_at;
            tracing::info!(conn_id = %conn_id, open_secs = open_for.num_seconds(), "screen disconnected");
        }
    }

    /// Push a sync state to every screen. Connections whose writer has gone
    /// away are dropped; returns how many screens received it.
    pub fn broadcast_status(&self, state: &SyncState) -> usize {
        let message = ServerMessage::sync_status(state.clone());
        let mut closed = Vec::new();
        let mut sent = 0;
        for entry in self.connections.iter() {
            match entry.sender.send(message.clone()) {
                Ok(()) => sent += 1,
                Err(_) => closed.push(entry.key().clone()),
            }
        }
        for id in closed {
            self.unregister(&id);
        }
        sent
    }

    /// Reply to one connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
