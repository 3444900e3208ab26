//! Per-connection chat protocol.
//!
//! A session moves `Disconnected -> Joining -> Joined -> Leaving ->
//! Disconnected`, passing through `Sending` once per message. Transitions on
//! one session are sequential; sessions run concurrently and share the
//! [`Gateway`].

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_types::events::GatewayEvent;
use tandem_types::models::{Connection, GroupKey, Message};

use crate::Gateway;
use crate::error::SessionError;
use crate::groups::GroupGuard;
use crate::store::{blocking, now};

/// Longest message body accepted, in characters.
pub const MAX_CONTENT_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Joined,
    Sending,
    Leaving,
}

/// Usernames are compared trimmed and lowercased everywhere.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub struct ChatSession {
    gateway: Gateway,
    connection: Connection,
    state: SessionState,
    group: Option<GroupKey>,
    /// Set once `disconnect` has run; the session cannot be reused.
    ended: bool,
}

impl ChatSession {
    /// Create a session for `username` and its outbound event queue.
    pub fn open(gateway: Gateway, username: &str) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let connection = Connection::new(Uuid::new_v4(), normalize_username(username));
        let rx = gateway.dispatcher().register_connection(connection.connection_id);

        let session = Self {
            gateway,
            connection,
            state: SessionState::Disconnected,
            group: None,
            ended: false,
        };
        (session, rx)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn group(&self) -> Option<&GroupKey> {
        self.group.as_ref()
    }

    /// Join the conversation with `peer` and receive its thread.
    ///
    /// If joining fails the session is back to `Disconnected`. If only the
    /// thread fetch fails the session stays `Joined` and the error is
    /// returned.
    pub async fn connect(&mut self, peer: &str) -> Result<(), SessionError> {
        self.ensure_can_connect()?;

        let peer = normalize_username(peer);
        if peer.is_empty() {
            return Err(SessionError::Validation("Peer username is required".into()));
        }

        let gateway = self.gateway.clone();
        let key = GroupKey::for_pair(&self.connection.username, &peer);

        // Held until the thread is delivered: a message sent to the group
        // meanwhile arrives after the snapshot, never inside it as well.
        let guard = gateway.groups().lock(&key).await;

        self.state = SessionState::Joining;
        if let Err(e) = self.join(&guard).await {
            self.state = SessionState::Disconnected;
            return Err(e);
        }
        self.state = SessionState::Joined;

        info!(
            "{} ({}) joined conversation with {}",
            self.connection.username, self.connection.connection_id, peer
        );

        self.send_online_users();
        let delivered = self.deliver_thread(&peer).await;
        drop(guard);
        delivered
    }

    /// Go online without opening a conversation. The connection receives
    /// presence events and notifications only, but may still send.
    pub async fn connect_presence(&mut self) -> Result<(), SessionError> {
        self.ensure_can_connect()?;

        self.state = SessionState::Joining;
        self.go_online();
        self.state = SessionState::Joined;

        info!(
            "{} ({}) online (presence only)",
            self.connection.username, self.connection.connection_id
        );

        self.send_online_users();
        Ok(())
    }

    pub async fn send(&mut self, receiver_username: &str, content: &str) -> Result<Message, SessionError> {
        if self.state != SessionState::Joined {
            return Err(SessionError::InvalidState(self.state));
        }

        self.state = SessionState::Sending;
        let result = send_message(&self.gateway, &self.connection.username, receiver_username, content).await;
        self.state = SessionState::Joined;
        result
    }

    /// Leave the group and go offline. Runs once; later calls do nothing.
    pub async fn disconnect(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.state = SessionState::Leaving;

        let gateway = self.gateway.clone();
        let connection_id = self.connection.connection_id;
        let username = self.connection.username.as_str();

        let detached = match gateway.groups().detach(connection_id).await {
            Ok(detached) => detached,
            Err(e) => {
                warn!("Could not persist detach of {}: {:#}", connection_id, e);
                gateway.groups().evict(connection_id).await
            }
        };

        if let Some((guard, group)) = detached {
            gateway
                .dispatcher()
                .send_to(group.connection_ids(), GatewayEvent::UpdatedGroup { group: group.clone() });
            drop(guard);
        }

        if gateway.presence().remove_connection(username, connection_id) {
            debug!("{} is now offline", username);
        }

        gateway.dispatcher().unregister_connection(connection_id);
        self.group = None;
        self.state = SessionState::Disconnected;

        info!("{} ({}) disconnected", username, connection_id);
    }

    /// Tell this connection that one of its commands failed.
    pub fn report(&self, error: &SessionError) {
        self.gateway.dispatcher().send_to_connection(
            self.connection.connection_id,
            GatewayEvent::Error {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        );
    }

    fn ensure_can_connect(&self) -> Result<(), SessionError> {
        if self.ended || self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState(self.state));
        }
        Ok(())
    }

    async fn join(&mut self, guard: &GroupGuard<'_>) -> Result<(), SessionError> {
        guard.get_or_create().await?;
        let group = guard.attach(&self.connection).await?;

        self.go_online();

        self.gateway
            .dispatcher()
            .send_to(group.connection_ids(), GatewayEvent::UpdatedGroup { group: group.clone() });

        self.group = Some(guard.key().clone());
        Ok(())
    }

    fn go_online(&self) {
        self.gateway
            .presence()
            .add_connection(&self.connection.username, self.connection.connection_id);
    }

    fn send_online_users(&self) {
        let usernames = self.gateway.presence().online_users();
        self.gateway
            .dispatcher()
            .send_to_connection(self.connection.connection_id, GatewayEvent::GetOnlineUsers { usernames });
    }

    /// Fetch the thread, mark what the caller received as read, and send it
    /// to this connection only.
    async fn deliver_thread(&self, peer: &str) -> Result<(), SessionError> {
        let caller = self.connection.username.clone();
        let store = self.gateway.store();

        let (current, other) = (caller.clone(), peer.to_string());
        let mut messages = blocking(store, move |s| s.message_thread(&current, &other)).await?;

        let unread: Vec<Uuid> = messages
            .iter()
            .filter(|m| m.receiver_username == caller && m.read_at.is_none())
            .map(|m| m.id)
            .collect();

        // Skip the write entirely when there is nothing to mark
        if !unread.is_empty() {
            let read_at = now();
            let expected = unread.len();
            let marked = blocking(store, move |s| s.mark_read(&unread, read_at)).await?;

            if marked == expected {
                for message in messages.iter_mut() {
                    if message.receiver_username == caller && message.read_at.is_none() {
                        message.read_at = Some(read_at);
                    }
                }
            } else {
                // Some receipts were set elsewhere first; show the stored ones
                let (current, other) = (caller.clone(), peer.to_string());
                messages = blocking(store, move |s| s.message_thread(&current, &other)).await?;
            }
            debug!("Marked {} of {} messages read for {}", marked, expected, caller);
        }

        self.gateway.dispatcher().send_to_connection(
            self.connection.connection_id,
            GatewayEvent::ReceiveMessageThread { messages },
        );
        Ok(())
    }
}

/// Deliver a direct message from `sender_username` to `receiver_username`.
///
/// If the receiver is attached to the conversation the message is stored as
/// already read; otherwise the receiver's live connections get a
/// notification. The group sees `NewMessage` only after the store commits.
pub async fn send_message(
    gateway: &Gateway,
    sender_username: &str,
    receiver_username: &str,
    content: &str,
) -> Result<Message, SessionError> {
    let sender_username = normalize_username(sender_username);
    let receiver_username = normalize_username(receiver_username);

    if receiver_username == sender_username {
        return Err(SessionError::Validation("You cannot send messages to yourself".into()));
    }
    if content.trim().is_empty() {
        return Err(SessionError::Validation("Message content is empty".into()));
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(SessionError::Validation(format!(
            "Message content exceeds {} characters",
            MAX_CONTENT_LEN
        )));
    }

    let store = gateway.store();
    let (s, r) = (sender_username.clone(), receiver_username.clone());
    let (sender, receiver) =
        blocking(store, move |store| Ok((store.find_user(&s)?, store.find_user(&r)?))).await?;

    let sender = sender.ok_or_else(|| SessionError::NotFound(format!("User {} not found", sender_username)))?;
    let receiver =
        receiver.ok_or_else(|| SessionError::NotFound(format!("User {} not found", receiver_username)))?;

    let mut message = Message {
        id: Uuid::new_v4(),
        sender_id: sender.id,
        sender_username: sender.username.clone(),
        receiver_id: receiver.id,
        receiver_username: receiver.username.clone(),
        content: content.to_string(),
        sent_at: now(),
        read_at: None,
        sender_deleted: false,
        receiver_deleted: false,
    };

    let key = GroupKey::for_pair(&sender.username, &receiver.username);
    let guard = gateway.groups().lock(&key).await;
    let group = guard.group();

    let notify = if group.has_user(&receiver.username) {
        message.read_at = Some(message.sent_at);
        None
    } else {
        Some(gateway.presence().connections(&receiver.username))
    };

    let persisted = message.clone();
    blocking(store, move |s| s.append_message(&persisted)).await?;

    if let Some(recipients) = notify {
        gateway
            .notifications()
            .new_message(&recipients, &sender.username, &sender.known_as);
    }

    gateway
        .dispatcher()
        .send_to(group.connection_ids(), GatewayEvent::NewMessage { message: message.clone() });
    drop(guard);

    debug!(
        "{} -> {} delivered (read on arrival: {})",
        message.sender_username,
        message.receiver_username,
        message.read_at.is_some()
    );
    Ok(message)
}
