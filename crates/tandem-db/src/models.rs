/// Database row types — these map directly to SQLite rows.
/// Distinct from tandem-types models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub known_as: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub receiver_id: String,
    pub receiver_username: String,
    pub content: String,
    pub sent_at: String,
    pub read_at: Option<String>,
    pub sender_deleted: bool,
    pub receiver_deleted: bool,
}
