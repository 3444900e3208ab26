use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use tandem_types::events::{GatewayCommand, GatewayEvent};

use crate::Gateway;
use crate::session::{ChatSession, SessionState};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one pre-authenticated WebSocket. With a `peer` the socket joins the
/// conversation with that user; without one it only tracks presence.
///
/// The JWT was already validated at the HTTP upgrade layer.
pub async fn handle_connection(
    socket: WebSocket,
    gateway: Gateway,
    username: String,
    peer: Option<String>,
) {
    let (mut sender, receiver) = socket.split();

    let (mut session, user_rx) = ChatSession::open(gateway, &username);
    let connection_id = session.connection().connection_id;

    info!("{} ({}) connected to gateway", username, connection_id);

    let ready = GatewayEvent::Ready {
        connection_id,
        username: session.connection().username.clone(),
    };
    if !send_event(&mut sender, &ready).await {
        session.disconnect().await;
        return;
    }

    let joined = match peer.as_deref() {
        Some(peer) => session.connect(peer).await,
        None => session.connect_presence().await,
    };
    if let Err(e) = joined {
        warn!("{} ({}) failed to join: {}", username, connection_id, e);
        if session.state() != SessionState::Joined {
            // Nothing will drain the queue, so answer on the socket directly
            let event = GatewayEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            };
            send_event(&mut sender, &event).await;
            session.disconnect().await;
            return;
        }
        session.report(&e);
    }

    run_connection_loop(sender, receiver, user_rx, Arc::new(Mutex::new(session))).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut user_rx: mpsc::UnboundedReceiver<GatewayEvent>,
    session: Arc<Mutex<ChatSession>>,
) {
    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let Some(event) = result else { break };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_session, cmd).await,
                    Err(e) => {
                        let session = recv_session.lock().await;
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            session.connection().username,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Exactly one cleanup per socket; ChatSession ignores repeats anyway
    session.lock().await.disconnect().await;
}

async fn handle_command(session: &Arc<Mutex<ChatSession>>, cmd: GatewayCommand) {
    let mut session = session.lock().await;
    match cmd {
        GatewayCommand::SendMessage {
            receiver_username,
            content,
        } => {
            if let Err(e) = session.send(&receiver_username, &content).await {
                warn!(
                    "{} -> {} send failed: {}",
                    session.connection().username,
                    receiver_username,
                    e
                );
                session.report(&e);
            }
        }
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}
