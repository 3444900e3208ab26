use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use tandem_db::models::{MessageRow, UserRow};
use tandem_db::{Database, DeleteOutcome};
use tandem_types::models::{Connection, ConnectionId, GroupKey, Message, User};

/// Persistence collaborator for groups, connections and messages.
///
/// Every method is one commit: it either fully applies or returns an error
/// with nothing written. Methods block, so async callers go through
/// [`blocking`].
pub trait ChatStore: Send + Sync + 'static {
    fn find_user(&self, username: &str) -> Result<Option<User>>;

    /// Messages between `current` and `other`, oldest first, minus those
    /// `current` deleted on their side.
    fn message_thread(&self, current: &str, other: &str) -> Result<Vec<Message>>;

    fn get_or_create_group(&self, key: &GroupKey) -> Result<()>;

    fn add_connection(&self, key: &GroupKey, connection: &Connection) -> Result<()>;

    /// Returns the group the connection was removed from, `None` if it was
    /// not attached.
    fn remove_connection(&self, connection_id: ConnectionId) -> Result<Option<GroupKey>>;

    fn clear_connections(&self) -> Result<usize>;

    fn append_message(&self, message: &Message) -> Result<()>;

    /// Set `read_at` on messages that do not have one yet.
    fn mark_read(&self, message_ids: &[Uuid], read_at: DateTime<Utc>) -> Result<usize>;

    fn delete_message(&self, message_id: Uuid, username: &str) -> Result<DeleteOutcome>;
}

/// Run a store call on the blocking pool.
pub async fn blocking<F, T>(store: &Arc<dyn ChatStore>, f: F) -> Result<T>
where
    F: FnOnce(&dyn ChatStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            anyhow!("store task failed: {}", e)
        })?
}

/// Current time at the precision the store keeps, so values read back
/// compare equal to the ones written.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl ChatStore for Database {
    fn find_user(&self, username: &str) -> Result<Option<User>> {
        Ok(self.get_user_by_username(username)?.map(user_from_row))
    }

    fn message_thread(&self, current: &str, other: &str) -> Result<Vec<Message>> {
        Ok(self
            .get_message_thread(current, other)?
            .into_iter()
            .map(message_from_row)
            .collect())
    }

    fn get_or_create_group(&self, key: &GroupKey) -> Result<()> {
        Database::get_or_create_group(self, key.as_str())?;
        Ok(())
    }

    fn add_connection(&self, key: &GroupKey, connection: &Connection) -> Result<()> {
        Database::add_connection(
            self,
            key.as_str(),
            &connection.connection_id.to_string(),
            &connection.username,
        )?;
        Ok(())
    }

    fn remove_connection(&self, connection_id: ConnectionId) -> Result<Option<GroupKey>> {
        Ok(Database::remove_connection(self, &connection_id.to_string())?.map(GroupKey::from_stored))
    }

    fn clear_connections(&self) -> Result<usize> {
        Database::clear_connections(self)
    }

    fn append_message(&self, message: &Message) -> Result<()> {
        self.insert_message(&message_to_row(message))
    }

    fn mark_read(&self, message_ids: &[Uuid], read_at: DateTime<Utc>) -> Result<usize> {
        let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        Database::mark_read(self, &ids, &format_time(read_at))
    }

    fn delete_message(&self, message_id: Uuid, username: &str) -> Result<DeleteOutcome> {
        Database::delete_message(self, &message_id.to_string(), username)
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    // Fixed width, so lexical order in SQLite is chronological order
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str, context: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite defaults are "YYYY-MM-DD HH:MM:SS" without timezone.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on {}: {}", raw, context, e);
            DateTime::default()
        })
}

fn parse_id(raw: &str, context: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}' on {}: {}", raw, context, e);
        Uuid::default()
    })
}

fn user_from_row(row: UserRow) -> User {
    let context = format!("user '{}'", row.username);
    User {
        id: parse_id(&row.id, &context),
        created_at: parse_time(&row.created_at, &context),
        username: row.username,
        known_as: row.known_as,
    }
}

fn message_from_row(row: MessageRow) -> Message {
    let context = format!("message '{}'", row.id);
    Message {
        id: parse_id(&row.id, &context),
        sender_id: parse_id(&row.sender_id, &context),
        receiver_id: parse_id(&row.receiver_id, &context),
        sent_at: parse_time(&row.sent_at, &context),
        read_at: row.read_at.as_deref().map(|t| parse_time(t, &context)),
        sender_username: row.sender_username,
        receiver_username: row.receiver_username,
        content: row.content,
        sender_deleted: row.sender_deleted,
        receiver_deleted: row.receiver_deleted,
    }
}

fn message_to_row(message: &Message) -> MessageRow {
    MessageRow {
        id: message.id.to_string(),
        sender_id: message.sender_id.to_string(),
        sender_username: message.sender_username.clone(),
        receiver_id: message.receiver_id.to_string(),
        receiver_username: message.receiver_username.clone(),
        content: message.content.clone(),
        sent_at: format_time(message.sent_at),
        read_at: message.read_at.map(format_time),
        sender_deleted: message.sender_deleted,
        receiver_deleted: message.receiver_deleted,
    }
}
