use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// JWT claims issued by the identity service. Shared by tandem-api (REST
/// middleware) and the gateway upgrade path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMessageRequest {
    pub receiver_username: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteMessageResponse {
    /// True when both participants have now deleted the message and the row
    /// is gone.
    pub removed: bool,
}

// -- Presence --

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub usernames: Vec<String>,
}

// -- Errors --

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
