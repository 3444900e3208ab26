use axum::{Extension, Json, extract::State};

use tandem_types::api::{Claims, OnlineUsersResponse};

use crate::auth::AppState;

pub async fn online_users(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        usernames: state.gateway.presence().online_users(),
    })
}
