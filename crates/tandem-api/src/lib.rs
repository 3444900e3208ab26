pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod presence;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// REST routes. Every route requires a bearer token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/messages", post(messages::send_message))
        .route("/messages/thread/{username}", get(messages::get_thread))
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route("/presence/online", get(presence::online_users))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
