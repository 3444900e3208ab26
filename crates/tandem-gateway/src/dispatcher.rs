use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

use tandem_types::events::GatewayEvent;
use tandem_types::models::ConnectionId;

/// Addressed delivery to live connections.
///
/// Callers name the recipients; the dispatcher only knows how to reach a
/// connection id. Each connection has one FIFO queue, so events sent to it
/// arrive in the order they were dispatched. Queueing never blocks, so it is
/// safe to dispatch while holding other locks.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Per-connection outbound queues: connection_id -> sender
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<GatewayEvent>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register an outbound queue for a connection. Returns the receiving end.
    pub fn register_connection(&self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<GatewayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id, tx);
        rx
    }

    pub fn unregister_connection(&self, connection_id: ConnectionId) {
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id);
    }

    /// Send one event to each named connection. Unknown ids are skipped.
    /// Returns how many connections it was queued for.
    pub fn send_to<'a, I>(&self, recipients: I, event: GatewayEvent) -> usize
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        let connections = self.inner.connections.read().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        for id in recipients {
            if let Some(tx) = connections.get(id) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            } else {
                trace!("No outbound queue for connection {}", id);
            }
        }
        delivered
    }

    pub fn send_to_connection(&self, connection_id: ConnectionId, event: GatewayEvent) -> bool {
        self.send_to([&connection_id], event) == 1
    }

    /// Send an event to every live connection.
    pub fn broadcast(&self, event: GatewayEvent) {
        let connections = self.inner.connections.read().unwrap_or_else(PoisonError::into_inner);
        for tx in connections.values() {
            let _ = tx.send(event.clone());
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
