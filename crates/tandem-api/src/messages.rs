use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::debug;
use uuid::Uuid;

use tandem_db::DeleteOutcome;
use tandem_gateway::session::{self, normalize_username};
use tandem_gateway::store::blocking;
use tandem_types::api::{Claims, CreateMessageRequest, DeleteMessageResponse};

use crate::auth::AppState;
use crate::error::ApiError;

/// Runs the same delivery protocol as a gateway `SendMessage`, so attached
/// sockets see `NewMessage` and online receivers get notified.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = session::send_message(
        &state.gateway,
        &claims.username,
        &req.receiver_username,
        &req.content,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Thread between the caller and `username`. Read-only: receipts are only
/// set when a socket joins the conversation.
pub async fn get_thread(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let current = normalize_username(&claims.username);
    let other = normalize_username(&username);

    let messages = blocking(state.gateway.store(), move |store| {
        store.message_thread(&current, &other)
    })
    .await?;

    Ok(Json(messages))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let username = normalize_username(&claims.username);
    let caller = username.clone();

    let outcome = blocking(state.gateway.store(), move |store| {
        store.delete_message(message_id, &caller)
    })
    .await?;

    debug!("{} deleted {}: {:?}", username, message_id, outcome);

    match outcome {
        DeleteOutcome::NotFound => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Message {} not found", message_id),
        )),
        DeleteOutcome::NotParticipant => Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "You are not a participant in this conversation",
        )),
        DeleteOutcome::Hidden => Ok(Json(DeleteMessageResponse { removed: false })),
        DeleteOutcome::Removed => Ok(Json(DeleteMessageResponse { removed: true })),
    }
}
