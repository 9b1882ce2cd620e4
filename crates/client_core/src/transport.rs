use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

const OUTBOUND_CAPACITY: usize = 32;
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid relay url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to open push transport: {0}")]
    Connect(String),
}

/// One open push connection, seen as text frames.
///
/// Dropping `outbound` asks the transport to close. The transport is closed
/// once `inbound` yields `None`.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Link, TransportError>;
}

/// Opens WebSocket links to a relay's `/ws` endpoint.
pub struct WsConnector {
    ws_url: Url,
}

impl WsConnector {
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            ws_url: ws_url(server_url)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.ws_url
    }
}

/// Maps an http(s) relay base url onto its websocket endpoint.
pub fn ws_url(server_url: &str) -> Result<Url, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(server_url).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("scheme must be http or https")),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot switch to a websocket scheme"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    Ok(url)
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        let (stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut writer, mut reader) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<String>(INBOUND_CAPACITY);
        let url = self.ws_url.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(error) = writer.send(Message::Text(text)).await {
                                warn!(%url, %error, "push transport write failed");
                                break;
                            }
                        }
                        None => {
                            let _ = writer.close().await;
                            break;
                        }
                    },
                    frame = reader.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            debug!(%url, %error, "push transport read failed");
                            break;
                        }
                    },
                }
            }
            debug!(%url, "push transport closed");
        });

        Ok(Link { outbound, inbound })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
