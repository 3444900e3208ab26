use crate::models::{MessageRow, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

/// Result of a per-side message delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    NotFound,
    /// The caller is neither sender nor receiver.
    NotParticipant,
    /// The caller's flag is set; the other side still sees the message.
    Hidden,
    /// Both flags are set and the row was removed.
    Removed,
}

const MESSAGE_COLUMNS: &str = "id, sender_id, sender_username, receiver_id, receiver_username, \
     content, sent_at, read_at, sender_deleted, receiver_deleted";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, known_as: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, known_as) VALUES (?1, ?2, ?3)",
                (id, username, known_as),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    // -- Groups & connections --

    /// Insert the group if it does not exist yet.
    pub fn get_or_create_group(&self, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("INSERT OR IGNORE INTO message_groups (name) VALUES (?1)", [name])?;
            Ok(())
        })
    }

    /// Attach a connection to a group, creating the group on first use.
    /// Both writes commit together or not at all.
    pub fn add_connection(&self, group_name: &str, connection_id: &str, username: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("INSERT OR IGNORE INTO message_groups (name) VALUES (?1)", [group_name])?;
            tx.execute(
                "INSERT INTO connections (connection_id, username, group_name) VALUES (?1, ?2, ?3)",
                (connection_id, username, group_name),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove a connection. Returns the name of the group it belonged to,
    /// or `None` if it was already gone.
    pub fn remove_connection(&self, connection_id: &str) -> Result<Option<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let group_name: Option<String> = tx
                .query_row(
                    "SELECT group_name FROM connections WHERE connection_id = ?1",
                    [connection_id],
                    |row| row.get(0),
                )
                .optional()?;

            if group_name.is_some() {
                tx.execute("DELETE FROM connections WHERE connection_id = ?1", [connection_id])?;
            }
            tx.commit()?;
            Ok(group_name)
        })
    }

    /// Drop every persisted connection. Run at startup: no live session
    /// survives a restart.
    pub fn clear_connections(&self) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM connections", [])?))
    }

    // -- Messages --

    pub fn insert_message(&self, message: &MessageRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, sender_username, receiver_id, receiver_username, \
                 content, sent_at, read_at, sender_deleted, receiver_deleted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    message.id,
                    message.sender_id,
                    message.sender_username,
                    message.receiver_id,
                    message.receiver_username,
                    message.content,
                    message.sent_at,
                    message.read_at,
                    message.sender_deleted,
                    message.receiver_deleted,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
            conn.query_row(&sql, [id], map_message).optional()
        })
    }

    /// Messages between `current` and `other`, oldest first, excluding those
    /// `current` has deleted on their side.
    pub fn get_message_thread(&self, current: &str, other: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE (receiver_username = ?1 AND sender_username = ?2 AND receiver_deleted = 0)
                    OR (sender_username = ?1 AND receiver_username = ?2 AND sender_deleted = 0)
                 ORDER BY sent_at ASC, rowid ASC",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([current, other], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Set `read_at` on the given messages. Rows that already carry a read
    /// timestamp keep it. Returns the number of rows changed.
    pub fn mark_read(&self, message_ids: &[String], read_at: &str) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        self.with_conn_mut(|conn| {
            let placeholders: Vec<String> = (2..=message_ids.len() + 1).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "UPDATE messages SET read_at = ?1 WHERE read_at IS NULL AND id IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::with_capacity(message_ids.len() + 1);
            params.push(&read_at);
            params.extend(message_ids.iter().map(|id| id as &dyn rusqlite::types::ToSql));

            let tx = conn.transaction()?;
            let changed = tx.execute(&sql, params.as_slice())?;
            tx.commit()?;
            Ok(changed)
        })
    }

    /// Per-side delete. The row is physically removed in the same
    /// transaction once both sides have deleted it.
    pub fn delete_message(&self, id: &str, username: &str) -> Result<DeleteOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, String, bool, bool)> = tx
                .query_row(
                    "SELECT sender_username, receiver_username, sender_deleted, receiver_deleted
                     FROM messages WHERE id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((sender, receiver, mut sender_deleted, mut receiver_deleted)) = row else {
                return Ok(DeleteOutcome::NotFound);
            };

            if sender != username && receiver != username {
                return Ok(DeleteOutcome::NotParticipant);
            }

            if sender == username {
                sender_deleted = true;
            }
            if receiver == username {
                receiver_deleted = true;
            }

            let outcome = if sender_deleted && receiver_deleted {
                tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
                DeleteOutcome::Removed
            } else {
                tx.execute(
                    "UPDATE messages SET sender_deleted = ?1, receiver_deleted = ?2 WHERE id = ?3",
                    rusqlite::params![sender_deleted, receiver_deleted, id],
                )?;
                DeleteOutcome::Hidden
            };

            tx.commit()?;
            Ok(outcome)
        })
    }
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, known_as, created_at FROM users WHERE username = ?1")?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                known_as: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_username: row.get(2)?,
        receiver_id: row.get(3)?,
        receiver_username: row.get(4)?,
        content: row.get(5)?,
        sent_at: row.get(6)?,
        read_at: row.get(7)?,
        sender_deleted: row.get(8)?,
        receiver_deleted: row.get(9)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
