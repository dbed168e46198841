//! Wire events exchanged with connected clients.
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}` with
//! camelCase names, e.g. `{"event":"join","data":{"identity":"alice"}}`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::Message;

/// Frames a client may send. Disconnect is implied by the socket closing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Join { identity: String },
    SendMessage { sender: String, receiver: String, text: String },
    Typing { sender: String, receiver: String },
}

/// Frames the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Delivered to the receiver's connection.
    MessageReceived { message: Message },
    /// Echoed to the sender's connection once the message is stored.
    MessageSent { message: Message },
    TypingIndicator { sender: String },
    /// Broadcast to every connection, identified or not.
    PresenceChanged {
        identity: String,
        online: bool,
        #[serde(
            rename = "lastSeen",
            with = "time::serde::rfc3339::option",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        last_seen: Option<OffsetDateTime>,
    },
}
