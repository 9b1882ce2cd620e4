use std::sync::Arc;

use futures::{Stream, StreamExt};
use gateway::{Gateway, GatewayError};
use shared::{
    domain::{Conversation, ConversationId, Member, Message, UserId},
    protocol::ServerEvent,
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    merge_cache::{MergeCache, MergeOutcome},
    poller::{PollConfig, SnapshotPoller},
    relay::RelayGateway,
    session::{ConnectionSession, RetryPolicy, SessionState},
    transport::{Connector, TransportError, WsConnector},
};

const VIEWPORT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewportEvent {
    MessagesInserted {
        conversation_id: ConversationId,
        count: usize,
    },
    ConnectionChanged(SessionState),
    GroupCreated(Conversation),
    MemberJoined {
        conversation_id: ConversationId,
        member: Member,
    },
    MemberLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

pub struct SyncClient {
    gateway: Arc<dyn Gateway>,
    connector: Arc<dyn Connector>,
    cache: Arc<Mutex<MergeCache>>,
    retry: RetryPolicy,
    poll: PollConfig,
}

impl SyncClient {
    pub fn new(gateway: Arc<dyn Gateway>, connector: Arc<dyn Connector>) -> Self {
        Self {
            gateway,
            connector,
            cache: Arc::new(Mutex::new(MergeCache::new())),
            retry: RetryPolicy::default(),
            poll: PollConfig::default(),
        }
    }

    /// A client talking to a relay over HTTP and its `/ws` endpoint.
    pub fn for_relay(server_url: &str) -> Result<Self, TransportError> {
        let connector = WsConnector::new(server_url)?;
        Ok(Self::new(
            Arc::new(RelayGateway::new(server_url)),
            Arc::new(connector),
        ))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn gateway(&self) -> Arc<dyn Gateway> {
        Arc::clone(&self.gateway)
    }

    pub fn cache(&self) -> Arc<Mutex<MergeCache>> {
        Arc::clone(&self.cache)
    }

    pub async fn mount(&self, conversation_id: ConversationId) -> ConversationViewport {
        self.cache.lock().await.retain(&conversation_id);
        let (events, _) = broadcast::channel(VIEWPORT_EVENT_CAPACITY);

        let session = ConnectionSession::spawn(Arc::clone(&self.connector), self.retry);
        session.set_conversation(conversation_id.clone());
        let pushed = session.events();
        session.connect();

        let pump = tokio::spawn(pump_events(
            pushed,
            Arc::clone(&self.cache),
            conversation_id.clone(),
            events.clone(),
        ));
        let watcher = tokio::spawn(watch_connection(session.watch_state(), events.clone()));
        let poller = SnapshotPoller {
            gateway: Arc::clone(&self.gateway),
            cache: Arc::clone(&self.cache),
            conversation_id: conversation_id.clone(),
            config: self.poll,
            events: events.clone(),
        };
        let polling = poller.clone().spawn();
        info!(conversation_id = %conversation_id, "viewport mounted");

        ConversationViewport {
            conversation_id,
            gateway: Arc::clone(&self.gateway),
            cache: Arc::clone(&self.cache),
            session: Some(session),
            poller,
            events,
            tasks: vec![pump, watcher, polling],
            released: false,
        }
    }
}

pub struct ConversationViewport {
    conversation_id: ConversationId,
    gateway: Arc<dyn Gateway>,
    cache: Arc<Mutex<MergeCache>>,
    session: Option<ConnectionSession>,
    poller: SnapshotPoller,
    events: broadcast::Sender<ViewportEvent>,
    tasks: Vec<JoinHandle<()>>,
    released: bool,
}

impl ConversationViewport {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn events(&self) -> broadcast::Receiver<ViewportEvent> {
        self.events.subscribe()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.cache
            .lock()
            .await
            .messages(&self.conversation_id)
            .to_vec()
    }

    pub fn connection_state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Disconnected, ConnectionSession::state)
    }

    pub fn watch_connection(&self) -> Option<watch::Receiver<SessionState>> {
        self.session.as_ref().map(ConnectionSession::watch_state)
    }

    pub fn reconnect(&self) {
        if let Some(session) = &self.session {
            session.connect();
        }
    }

    /// Posts `text` and merges the canonical echo right away; the pushed copy
    /// that follows is then a duplicate.
    pub async fn send(&self, text: &str) -> Result<Message, GatewayError> {
        if text.trim().is_empty() {
            return Err(GatewayError::Invalid("message text is empty".into()));
        }
        let source_guid = Uuid::new_v4().to_string();
        let message = self
            .gateway
            .post_message(&self.conversation_id, text, &source_guid)
            .await?;
        let merged = self
            .cache
            .lock()
            .await
            .apply_delta(&self.conversation_id, message.clone());
        match merged {
            Ok(true) => self.notify_inserted(1),
            Ok(false) => {}
            Err(error) => warn!(%error, "canonical echo not merged"),
        }
        Ok(message)
    }

    pub async fn load_older(&self) -> Result<MergeOutcome, GatewayError> {
        let before_id = self
            .cache
            .lock()
            .await
            .oldest(&self.conversation_id)
            .map(|message| message.id.clone());
        let page = self
            .gateway
            .fetch_messages(
                &self.conversation_id,
                before_id.as_ref(),
                self.poller.config.page_size,
            )
            .await?;
        let outcome = self
            .cache
            .lock()
            .await
            .apply_snapshot(&self.conversation_id, page);
        self.notify_inserted(outcome.inserted);
        Ok(outcome)
    }

    pub async fn refresh(&self) -> Result<MergeOutcome, GatewayError> {
        self.poller.poll_once().await
    }

    pub async fn unmount(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(session) = self.session.take() {
            session.disconnect();
            session.shutdown().await;
        }
        self.cache.lock().await.release(&self.conversation_id);
        self.released = true;
        info!(conversation_id = %self.conversation_id, "viewport unmounted");
    }

    fn notify_inserted(&self, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self.events.send(ViewportEvent::MessagesInserted {
            conversation_id: self.conversation_id.clone(),
            count,
        });
    }
}

impl Drop for ConversationViewport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if self.released {
            return;
        }
        if let Ok(mut cache) = self.cache.try_lock() {
            cache.release(&self.conversation_id);
            return;
        }
        let cache = Arc::clone(&self.cache);
        let conversation_id = self.conversation_id.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    cache.lock().await.release(&conversation_id);
                });
            }
            Err(_) => warn!(
                conversation_id = %conversation_id,
                "viewport dropped outside a runtime; cache entry not released"
            ),
        }
    }
}

async fn pump_events(
    mut pushed: impl Stream<Item = ServerEvent> + Unpin,
    cache: Arc<Mutex<MergeCache>>,
    conversation_id: ConversationId,
    events: broadcast::Sender<ViewportEvent>,
) {
    while let Some(event) = pushed.next().await {
        let notice = match event {
            ServerEvent::NewMessage { group_id, message } if group_id == conversation_id => {
                let merged = cache.lock().await.apply_delta(&conversation_id, message);
                match merged {
                    Ok(true) => Some(ViewportEvent::MessagesInserted {
                        conversation_id: conversation_id.clone(),
                        count: 1,
                    }),
                    Ok(false) => {
                        debug!(conversation_id = %conversation_id, "pushed message already cached");
                        None
                    }
                    Err(error) => {
                        warn!(conversation_id = %conversation_id, %error, "pushed message rejected");
                        None
                    }
                }
            }
            ServerEvent::GroupCreated { group } => Some(ViewportEvent::GroupCreated(group)),
            ServerEvent::MemberJoined { group_id, member } if group_id == conversation_id => {
                Some(ViewportEvent::MemberJoined {
                    conversation_id: group_id,
                    member,
                })
            }
            ServerEvent::MemberLeft { group_id, user_id } if group_id == conversation_id => {
                Some(ViewportEvent::MemberLeft {
                    conversation_id: group_id,
                    user_id,
                })
            }
            other => {
                debug!(kind = other.kind(), "event for another conversation ignored");
                None
            }
        };
        if let Some(notice) = notice {
            let _ = events.send(notice);
        }
    }
}

async fn watch_connection(
    mut state: watch::Receiver<SessionState>,
    events: broadcast::Sender<ViewportEvent>,
) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        let _ = events.send(ViewportEvent::ConnectionChanged(current));
    }
}

#[cfg(test)]
#[path = "tests/viewport_tests.rs"]
mod tests;
