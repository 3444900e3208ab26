use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            known_as    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS message_groups (
            name        TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS connections (
            connection_id   TEXT PRIMARY KEY,
            username        TEXT NOT NULL,
            group_name      TEXT NOT NULL REFERENCES message_groups(name)
        );

        CREATE INDEX IF NOT EXISTS idx_connections_group
            ON connections(group_name);

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,
            sender_id           TEXT NOT NULL REFERENCES users(id),
            sender_username     TEXT NOT NULL,
            receiver_id         TEXT NOT NULL REFERENCES users(id),
            receiver_username   TEXT NOT NULL,
            content             TEXT NOT NULL,
            sent_at             TEXT NOT NULL,
            read_at             TEXT,
            sender_deleted      INTEGER NOT NULL DEFAULT 0,
            receiver_deleted    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_username, receiver_username, sent_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
