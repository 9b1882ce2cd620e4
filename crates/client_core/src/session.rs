use std::{sync::Arc, time::Duration};

use futures::Stream;
use shared::{
    domain::ConversationId,
    protocol::{ClientFrame, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::transport::{Connector, Link, TransportError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// Retries are exhausted. Only an explicit `connect()` leaves this state.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub max_backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 5,
            max_backoff_multiplier: 32,
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^retry_count`, capped at `max_backoff_multiplier * base_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry_count)
            .unwrap_or(u32::MAX)
            .min(self.max_backoff_multiplier.max(1));
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    OpenTransport,
    CloseTransport,
    SendJoin(ConversationId),
    ScheduleRetry(Duration),
    CancelRetry,
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    policy: RetryPolicy,
    retry_count: u32,
    retry_pending: bool,
    reconnect_after_close: bool,
    conversation: Option<ConversationId>,
}

impl SessionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: SessionState::Disconnected,
            policy,
            retry_count: 0,
            retry_pending: false,
            reconnect_after_close: false,
            conversation: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    pub fn connect(&mut self) -> Vec<SessionAction> {
        match self.state {
            SessionState::Connecting | SessionState::Open => Vec::new(),
            SessionState::Closing => {
                self.reconnect_after_close = true;
                Vec::new()
            }
            SessionState::Failed => {
                self.retry_count = 0;
                self.begin_open()
            }
            SessionState::Disconnected => self.begin_open(),
        }
    }

    pub fn on_established(&mut self) -> Vec<SessionAction> {
        if self.state != SessionState::Connecting {
            // An open that completed after it was abandoned.
            return vec![SessionAction::CloseTransport];
        }
        self.state = SessionState::Open;
        self.retry_count = 0;
        let mut actions = Vec::new();
        if std::mem::take(&mut self.retry_pending) {
            actions.push(SessionAction::CancelRetry);
        }
        if let Some(conversation_id) = &self.conversation {
            actions.push(SessionAction::SendJoin(conversation_id.clone()));
        }
        actions
    }

    /// The transport closed, or an open attempt failed.
    pub fn on_closed(&mut self) -> Vec<SessionAction> {
        match self.state {
            SessionState::Closing => {
                self.state = SessionState::Disconnected;
                if std::mem::take(&mut self.reconnect_after_close) {
                    self.begin_open()
                } else {
                    Vec::new()
                }
            }
            SessionState::Open | SessionState::Connecting => {
                self.state = SessionState::Disconnected;
                if self.retry_count >= self.policy.max_retries {
                    self.state = SessionState::Failed;
                    return Vec::new();
                }
                self.retry_pending = true;
                vec![SessionAction::ScheduleRetry(
                    self.policy.delay_for(self.retry_count),
                )]
            }
            SessionState::Disconnected | SessionState::Failed => Vec::new(),
        }
    }

    pub fn on_retry_timer(&mut self) -> Vec<SessionAction> {
        if self.state != SessionState::Disconnected || !self.retry_pending {
            return Vec::new();
        }
        self.retry_pending = false;
        self.retry_count += 1;
        self.state = SessionState::Connecting;
        vec![SessionAction::OpenTransport]
    }

    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        self.reconnect_after_close = false;
        let mut actions = Vec::new();
        if std::mem::take(&mut self.retry_pending) {
            actions.push(SessionAction::CancelRetry);
        }
        match self.state {
            SessionState::Open => {
                self.state = SessionState::Closing;
                actions.push(SessionAction::CloseTransport);
            }
            SessionState::Connecting => {
                self.state = SessionState::Disconnected;
                actions.push(SessionAction::CloseTransport);
            }
            SessionState::Closing | SessionState::Disconnected | SessionState::Failed => {}
        }
        actions
    }

    pub fn set_conversation(&mut self, conversation_id: ConversationId) -> Vec<SessionAction> {
        self.conversation = Some(conversation_id.clone());
        if self.state == SessionState::Open {
            vec![SessionAction::SendJoin(conversation_id)]
        } else {
            Vec::new()
        }
    }

    fn begin_open(&mut self) -> Vec<SessionAction> {
        self.state = SessionState::Connecting;
        let mut actions = Vec::new();
        if std::mem::take(&mut self.retry_pending) {
            actions.push(SessionAction::CancelRetry);
        }
        actions.push(SessionAction::OpenTransport);
        actions
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    SetConversation(ConversationId),
    Shutdown,
}

pub struct ConnectionSession {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ServerEvent>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl ConnectionSession {
    pub fn spawn(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(SessionState::Disconnected);
        let driver = Driver {
            machine: SessionMachine::new(policy),
            connector,
            opening: None,
            outbound: None,
            inbound: None,
            retry_at: None,
            events: events.clone(),
            state_tx,
        };
        let task = tokio::spawn(driver.run(command_rx));
        Self {
            commands,
            events,
            state,
            task,
        }
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    pub fn set_conversation(&self, conversation_id: ConversationId) {
        self.command(Command::SetConversation(conversation_id));
    }

    /// Well-formed events received after this call.
    pub fn events(&self) -> impl Stream<Item = ServerEvent> + Send + Unpin + 'static {
        tokio_stream::StreamExt::filter_map(
            BroadcastStream::new(self.events.subscribe()),
            |item| match item {
                Ok(event) => Some(event),
                Err(lagged) => {
                    warn!(%lagged, "session event subscriber fell behind");
                    None
                }
            },
        )
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub async fn shutdown(self) {
        self.command(Command::Shutdown);
        let _ = self.task.await;
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("session driver already stopped");
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Opened(Result<Link, TransportError>),
    Frame(Option<String>),
    RetryDue,
}

struct Driver {
    machine: SessionMachine,
    connector: Arc<dyn Connector>,
    opening: Option<JoinHandle<Result<Link, TransportError>>>,
    outbound: Option<mpsc::Sender<String>>,
    inbound: Option<mpsc::Receiver<String>>,
    retry_at: Option<Instant>,
    events: broadcast::Sender<ServerEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                opened = wait_opened(&mut self.opening) => Wake::Opened(opened),
                frame = next_frame(&mut self.inbound) => Wake::Frame(frame),
                () = retry_due(self.retry_at) => Wake::RetryDue,
            };

            let actions = match wake {
                Wake::Command(Some(Command::Connect)) => self.machine.connect(),
                Wake::Command(Some(Command::Disconnect)) => self.machine.disconnect(),
                Wake::Command(Some(Command::SetConversation(conversation_id))) => {
                    self.machine.set_conversation(conversation_id)
                }
                Wake::Command(Some(Command::Shutdown)) | Wake::Command(None) => {
                    self.teardown();
                    break;
                }
                Wake::Opened(result) => {
                    self.opening = None;
                    match result {
                        Ok(link) => {
                            self.outbound = Some(link.outbound);
                            self.inbound = Some(link.inbound);
                            self.machine.on_established()
                        }
                        Err(error) => {
                            warn!(%error, "push transport open failed");
                            self.machine.on_closed()
                        }
                    }
                }
                Wake::Frame(Some(text)) => {
                    self.dispatch(&text);
                    Vec::new()
                }
                Wake::Frame(None) => {
                    self.outbound = None;
                    self.inbound = None;
                    self.machine.on_closed()
                }
                Wake::RetryDue => {
                    self.retry_at = None;
                    self.machine.on_retry_timer()
                }
            };
            self.perform(actions);
            self.publish_state();
        }
    }

    fn perform(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::OpenTransport => {
                    if let Some(stale) = self.opening.take() {
                        stale.abort();
                    }
                    let connector = Arc::clone(&self.connector);
                    self.opening = Some(tokio::spawn(async move { connector.open().await }));
                }
                SessionAction::CloseTransport => {
                    if let Some(pending) = self.opening.take() {
                        pending.abort();
                    }
                    // The transport closes once its writer is gone; the
                    // closure is observed as `inbound` ending.
                    self.outbound = None;
                }
                SessionAction::SendJoin(conversation_id) => self.send_join(conversation_id),
                SessionAction::ScheduleRetry(delay) => {
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.machine.retry_count() + 1,
                        "scheduling push reconnect"
                    );
                    self.retry_at = Some(Instant::now() + delay);
                }
                SessionAction::CancelRetry => self.retry_at = None,
            }
        }
    }

    fn send_join(&self, conversation_id: ConversationId) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        let frame = ClientFrame::JoinGroup {
            group_id: conversation_id.clone(),
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "failed to encode join frame");
                return;
            }
        };
        if outbound.try_send(text).is_err() {
            warn!(conversation_id = %conversation_id, "join frame not sent; transport busy or closed");
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::Unknown) => debug!("ignoring unknown server event"),
            Ok(event) => {
                let _ = self.events.send(event);
            }
            Err(error) => warn!(%error, "dropping malformed server frame"),
        }
    }

    fn publish_state(&self) {
        let next = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = ?*current, to = ?next, "push session state changed");
            *current = next;
            true
        });
    }

    fn teardown(&mut self) {
        if let Some(pending) = self.opening.take() {
            pending.abort();
        }
        self.outbound = None;
        self.inbound = None;
        self.retry_at = None;
        self.state_tx.send_replace(SessionState::Disconnected);
    }
}

async fn wait_opened(
    opening: &mut Option<JoinHandle<Result<Link, TransportError>>>,
) -> Result<Link, TransportError> {
    match opening {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(TransportError::Connect(join_error.to_string())),
        },
        None => std::future::pending().await,
    }
}

async fn next_frame(inbound: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match inbound {
        Some(inbound) => inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
