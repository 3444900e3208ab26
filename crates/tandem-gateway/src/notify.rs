use std::collections::HashSet;

use tracing::debug;

use tandem_types::events::GatewayEvent;
use tandem_types::models::ConnectionId;

use crate::dispatcher::Dispatcher;

/// Presence-facing channel: online/offline transitions and new-message
/// notices for users who are not looking at the conversation.
#[derive(Clone)]
pub struct NotificationChannel {
    dispatcher: Dispatcher,
}

impl NotificationChannel {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Tell the given connections that `sender` wrote to them. Dropped
    /// silently when the set is empty.
    pub fn new_message(
        &self,
        recipients: &HashSet<ConnectionId>,
        sender_username: &str,
        sender_known_as: &str,
    ) -> usize {
        if recipients.is_empty() {
            debug!("No live connections for notification from {}, dropped", sender_username);
            return 0;
        }

        self.dispatcher
            .send_to(
                recipients,
                GatewayEvent::NewMessageReceived {
                    username: sender_username.to_string(),
                    known_as: sender_known_as.to_string(),
                },
            )
    }

    pub fn user_online(&self, username: &str) {
        self.dispatcher
            .broadcast(GatewayEvent::UserIsOnline {
                username: username.to_string(),
            });
    }

    pub fn user_offline(&self, username: &str) {
        self.dispatcher
            .broadcast(GatewayEvent::UserIsOffline {
                username: username.to_string(),
            });
    }
}
