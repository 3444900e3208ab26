use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one live WebSocket session. Never persisted across restarts.
pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub known_as: String,
    pub created_at: DateTime<Utc>,
}

/// A live session bound to one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub username: String,
}

impl Connection {
    pub fn new(connection_id: ConnectionId, username: impl Into<String>) -> Self {
        Self {
            connection_id,
            username: username.into(),
        }
    }
}

/// Conversation identity for a pair of users.
///
/// The two names are ordered ordinally and joined with `:`. Any `%` or `:`
/// inside a name is percent-escaped first, so two different pairs can never
/// produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn for_pair(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        GroupKey(format!("{}:{}", escape(first), escape(second)))
    }

    /// Wrap a key that was read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        GroupKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            _ => out.push(c),
        }
    }
    out
}

/// A conversation plus the connections currently attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: GroupKey,
    pub connections: Vec<Connection>,
}

impl Group {
    pub fn empty(name: GroupKey) -> Self {
        Self {
            name,
            connections: Vec::new(),
        }
    }

    pub fn has_user(&self, username: &str) -> bool {
        self.connections.iter().any(|c| c.username == username)
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.connections.iter().map(|c| &c.connection_id)
    }
}

/// A direct message between two users. Users are referenced by id and
/// username only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub receiver_id: Uuid,
    pub receiver_username: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub sender_deleted: bool,
    pub receiver_deleted: bool,
}
