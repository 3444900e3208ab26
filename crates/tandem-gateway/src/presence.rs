//! Who is online, and through which connections.
//!
//! Entries exist only while a user has at least one live connection. All
//! updates for one username run under that username's map entry lock, so a
//! set update, the removal of an emptied entry and the resulting
//! online/offline event are a single step. Observers therefore see a user's
//! transitions in the order they happened.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use tandem_types::models::ConnectionId;

use crate::notify::NotificationChannel;

pub struct PresenceRegistry {
    users: DashMap<String, HashSet<ConnectionId>>,
    notifications: NotificationChannel,
}

impl PresenceRegistry {
    pub fn new(notifications: NotificationChannel) -> Self {
        Self {
            users: DashMap::new(),
            notifications,
        }
    }

    /// Register a connection. Returns true iff it is now the user's only
    /// live connection, in which case `UserIsOnline` has been queued.
    pub fn add_connection(&self, username: &str, connection_id: ConnectionId) -> bool {
        let mut set = self.users.entry(username.to_string()).or_default();
        let first = set.insert(connection_id) && set.len() == 1;
        if first {
            self.notifications.user_online(username);
        }
        first
    }

    /// Unregister a connection. Returns true iff the user has no
    /// connections left, in which case `UserIsOffline` has been queued.
    /// Unknown connections are ignored.
    pub fn remove_connection(&self, username: &str, connection_id: ConnectionId) -> bool {
        match self.users.entry(username.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().remove(&connection_id) {
                    return false;
                }
                if !entry.get().is_empty() {
                    return false;
                }
                self.notifications.user_offline(username);
                entry.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn connections(&self, username: &str) -> HashSet<ConnectionId> {
        self.users
            .get(username)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Snapshot of online usernames, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.users.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }
}
