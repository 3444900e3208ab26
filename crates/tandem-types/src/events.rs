use serde::{Deserialize, Serialize};

use crate::models::{ConnectionId, Group, Message};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server accepted the session
    Ready {
        connection_id: ConnectionId,
        username: String,
    },

    /// Membership of a conversation group changed
    UpdatedGroup { group: Group },

    /// Full thread for the conversation, sent to the joining connection only
    ReceiveMessageThread { messages: Vec<Message> },

    /// A message was posted to the conversation
    NewMessage { message: Message },

    /// Out-of-band notice for a user who is online but not viewing the thread
    NewMessageReceived { username: String, known_as: String },

    /// A user came online (first live connection)
    UserIsOnline { username: String },

    /// A user went offline (last live connection closed)
    UserIsOffline { username: String },

    /// Snapshot of online users, sent once when a connection opens
    GetOnlineUsers { usernames: Vec<String> },

    /// A command from this connection failed
    Error { code: String, message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Send a direct message
    SendMessage {
        receiver_username: String,
        content: String,
    },
}
