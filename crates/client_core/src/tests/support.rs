use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Message, MessageId, UserId},
    protocol::{ClientFrame, ServerEvent},
};
use tokio::{sync::mpsc, time::Instant};

use crate::transport::{Connector, Link, TransportError};

/// The far end of a scripted link.
pub(crate) struct Peer {
    pub(crate) from_client: mpsc::Receiver<String>,
    pub(crate) to_client: mpsc::Sender<String>,
}

impl Peer {
    pub(crate) async fn expect_join(&mut self) -> ConversationId {
        let text = self.from_client.recv().await.expect("join frame");
        match serde_json::from_str::<ClientFrame>(&text).expect("client frame") {
            ClientFrame::JoinGroup { group_id } => group_id,
        }
    }

    pub(crate) async fn push(&self, event: &ServerEvent) {
        let text = serde_json::to_string(event).expect("encode event");
        self.push_raw(&text).await;
    }

    pub(crate) async fn push_raw(&self, text: &str) {
        self.to_client
            .send(text.to_string())
            .await
            .expect("push frame");
    }
}

/// In-process [`Connector`] whose links are handed to the test as [`Peer`]s.
pub(crate) struct ScriptedConnector {
    accept: AtomicBool,
    opens: Mutex<Vec<Instant>>,
    peers: mpsc::UnboundedSender<Peer>,
}

impl ScriptedConnector {
    pub(crate) fn new(accept: bool) -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept: AtomicBool::new(accept),
                opens: Mutex::new(Vec::new()),
                peers,
            },
            peer_rx,
        )
    }

    pub(crate) fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opens.lock().expect("opens").len()
    }

    pub(crate) fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().expect("opens").clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        self.opens.lock().expect("opens").push(Instant::now());
        if !self.accept.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(16);
        let (inbound_tx, inbound) = mpsc::channel::<String>(16);
        let (peer_out_tx, from_client) = mpsc::channel::<String>(16);
        let (to_client, mut peer_in_rx) = mpsc::channel::<String>(16);

        // Behaves like a socket pump: either side going away closes both.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(text) => {
                            if peer_out_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = peer_in_rx.recv() => match frame {
                        Some(text) => {
                            if inbound_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let _ = self.peers.send(Peer {
            from_client,
            to_client,
        });
        Ok(Link { outbound, inbound })
    }
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).expect("timestamp")
}

pub(crate) fn message(id: &str, group_id: &str, seconds: i64) -> Message {
    Message {
        id: MessageId::new(id),
        source_guid: None,
        user_id: UserId::new("u-other"),
        name: "other".to_string(),
        text: Some(format!("text of {id}")),
        attachments: Vec::new(),
        system: false,
        created_at: at(seconds),
        group_id: ConversationId::new(group_id),
    }
}

pub(crate) fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|message| message.id.as_str()).collect()
}
