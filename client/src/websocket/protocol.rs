//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and tagged by `type`.

use rollcall_engine::{DomainEvent, EventFilter, SyncState};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving events that match `filter`.
    Subscribe {
        #[serde(default)]
        filter: EventFilter,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Stop a subscription made on this connection.
    Unsubscribe {
        subscription_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Ask for the current sync status.
    Status {
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        subscription_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Unsubscribed {
        subscription_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// A domain event matching one of the connection's subscriptions.
    Event {
        subscription_id: String,
        event: DomainEvent,
    },

    /// Current sync state. Pushed on every change.
    SyncStatus {
        state: SyncState,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    pub fn sync_status(state: SyncState) -> Self {
        ServerMessage::SyncStatus {
            state,
            request_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_engine::{Audience, EntityType};

    #[test]
    fn test_subscribe_deserialization() {
        let json = r#"{
            "type": "subscribe",
            "filter": {"kinds": ["notification"], "audience": "parents", "targetId": "S1"},
            "request_id": "req-1"
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Subscribe { filter, request_id } => {
                assert_eq!(filter.kinds, vec![EntityType::Notification]);
                assert_eq!(filter.audience, Some(Audience::Parents));
                assert_eq!(filter.target_id.as_deref(), Some("S1"));
                assert_eq!(request_id.as_deref(), Some("req-1"));
            }
            _ => panic!("Expected Subscribe message"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "subscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { filter, .. } if filter == EventFilter::all()));

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_serialization() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let msg = ServerMessage::error("bad filter", Some("req-1".to_string()));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"bad filter""#));
        assert!(json.contains(r#""request_id":"req-1""#));

        let json = serde_json::to_value(ServerMessage::sync_status(SyncState::default())).unwrap();
        assert_eq!(json["type"], "sync_status");
        assert_eq!(json["state"]["status"], "offline");
        assert_eq!(json["state"]["pendingCount"], 0);
    }
}
