pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod groups;
pub mod notify;
pub mod presence;
pub mod session;
pub mod store;

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::groups::GroupRegistry;
use crate::notify::NotificationChannel;
use crate::presence::PresenceRegistry;
use crate::store::ChatStore;

/// Process-wide live state shared by every session. Built once at startup
/// and handed to sessions and REST handlers.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    store: Arc<dyn ChatStore>,
    presence: PresenceRegistry,
    groups: GroupRegistry,
    dispatcher: Dispatcher,
    notifications: NotificationChannel,
}

impl Gateway {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        let dispatcher = Dispatcher::new();
        let notifications = NotificationChannel::new(dispatcher.clone());
        Self {
            inner: Arc::new(GatewayInner {
                presence: PresenceRegistry::new(notifications.clone()),
                groups: GroupRegistry::new(store.clone()),
                notifications,
                dispatcher,
                store,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.inner.store
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.inner.groups
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn notifications(&self) -> &NotificationChannel {
        &self.inner.notifications
    }
}
