mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use tandem_api::auth::{AppState, AppStateInner, create_token, decode_token};
use tandem_api::middleware::bearer_token;
use tandem_db::Database;
use tandem_gateway::connection;
use tandem_gateway::session::normalize_username;
use tandem_gateway::Gateway;

use crate::config::Config;

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    /// Peer to open a conversation with. Absent for presence-only sockets.
    user: Option<String>,
    access_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tandem_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let db = Database::open(&config.db_path)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("add-user") => return add_user(&db, &config, &args[1..]),
        Some(other) => bail!("unknown command '{}' (expected: add-user)", other),
        None => {}
    }

    // Sockets from a previous run are gone; their rows would make groups
    // look occupied.
    let purged = db.clear_connections()?;
    if purged > 0 {
        info!("Purged {} stale connections", purged);
    }

    let gateway = Gateway::new(Arc::new(db));
    let state: AppState = Arc::new(AppStateInner {
        gateway,
        jwt_secret: config.jwt_secret.clone(),
    });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .merge(tandem_api::router(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Tandem server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Authenticate before upgrading; the socket handler trusts the username.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let token = query
        .access_token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = decode_token(&state.jwt_secret, token).ok_or_else(|| {
        warn!("Rejected gateway upgrade with invalid token");
        StatusCode::UNAUTHORIZED
    })?;

    let peer = query.user.filter(|p| !p.trim().is_empty());
    let gateway = state.gateway.clone();

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, gateway, claims.username, peer)
    }))
}

fn add_user(db: &Database, config: &Config, args: &[String]) -> anyhow::Result<()> {
    let username = args
        .first()
        .map(|raw| normalize_username(raw))
        .filter(|name| !name.is_empty())
        .context("usage: tandem add-user <username> [known_as]")?;
    let known_as = args.get(1).cloned().unwrap_or_else(|| username.clone());

    if db.get_user_by_username(&username)?.is_some() {
        bail!("user '{}' already exists", username);
    }

    let user_id = Uuid::new_v4();
    db.create_user(&user_id.to_string(), &username, &known_as)?;
    info!("Created user {} ({})", username, user_id);

    let token = create_token(&config.jwt_secret, user_id, &username)?;
    println!("{}", token);
    Ok(())
}
