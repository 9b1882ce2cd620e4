use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use shared::{domain::ConversationId, protocol::ServerEvent};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub(crate) type Outbox = mpsc::Sender<ServerEvent>;

/// A routed target. Holds a clone of the connection's outbox, never the socket.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) id: ConnectionId,
    outbox: Outbox,
}

impl ConnectionHandle {
    pub(crate) fn try_deliver(&self, event: ServerEvent) -> Result<(), &'static str> {
        self.outbox.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => "outbox full",
            TrySendError::Closed(_) => "connection closed",
        })
    }
}

struct Subscription {
    outbox: Outbox,
    conversation: Option<ConversationId>,
}

/// Which conversation every live connection watches. One conversation per
/// connection; the latest join wins.
pub(crate) struct SubscriptionRouter {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Subscription>>,
}

impl SubscriptionRouter {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) async fn on_connect(&self, id: ConnectionId, outbox: Outbox) {
        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            Subscription {
                outbox,
                conversation: None,
            },
        );
        debug!(connection_id = %id, live = connections.len(), "connection registered");
    }

    /// Returns false when the connection is unknown (already gone).
    pub(crate) async fn on_join(&self, id: ConnectionId, conversation_id: ConversationId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(subscription) = connections.get_mut(&id) else {
            return false;
        };
        subscription.conversation = Some(conversation_id);
        true
    }

    pub(crate) async fn on_disconnect(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&id).is_some();
        debug!(connection_id = %id, live = connections.len(), removed, "connection unregistered");
        removed
    }

    /// Snapshot of open connections watching `conversation_id`, taken under the lock.
    pub(crate) async fn route(&self, conversation_id: &ConversationId) -> Vec<ConnectionHandle> {
        self.collect(|subscription| subscription.conversation.as_ref() == Some(conversation_id))
            .await
    }

    /// Snapshot of every open connection, joined or not.
    pub(crate) async fn everyone(&self) -> Vec<ConnectionHandle> {
        self.collect(|_| true).await
    }

    pub(crate) async fn subscription_of(&self, id: ConnectionId) -> Option<ConversationId> {
        let connections = self.connections.read().await;
        connections
            .get(&id)
            .and_then(|subscription| subscription.conversation.clone())
    }

    pub(crate) async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn collect(&self, filter: impl Fn(&Subscription) -> bool) -> Vec<ConnectionHandle> {
        let connections = self.connections.read().await;
        let mut handles: Vec<ConnectionHandle> = connections
            .iter()
            .filter(|(_, subscription)| !subscription.outbox.is_closed() && filter(subscription))
            .map(|(id, subscription)| ConnectionHandle {
                id: *id,
                outbox: subscription.outbox.clone(),
            })
            .collect();
        handles.sort_by_key(|handle| handle.id);
        handles
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
