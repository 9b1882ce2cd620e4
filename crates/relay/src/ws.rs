use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use shared::protocol::ClientFrame;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{app_state::AppState, registry::ConnectionId};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut inbox) = mpsc::channel(state.outbox_capacity);
    let connection_id = state.router.allocate_id();
    state.router.on_connect(connection_id, outbox).await;
    let live = state.router.connection_count().await;
    info!(
        %connection_id,
        live,
        "viewer connected"
    );

    let send_task = tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%connection_id, %error, "failed to encode server event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_client_frame(&state, connection_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%connection_id, %error, "websocket receive failed");
                break;
            }
        }
    }

    state.router.on_disconnect(connection_id).await;
    send_task.abort();
    info!(%connection_id, "viewer disconnected");
}

async fn handle_client_frame(state: &AppState, connection_id: ConnectionId, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%connection_id, %error, "dropping malformed client frame");
            return;
        }
    };
    match frame {
        ClientFrame::JoinGroup { group_id } => {
            if group_id.is_empty() {
                warn!(%connection_id, "dropping join_group without a group id");
                return;
            }
            let previous = state.router.subscription_of(connection_id).await;
            if state.router.on_join(connection_id, group_id.clone()).await {
                info!(
                    %connection_id,
                    conversation_id = %group_id,
                    previous = ?previous,
                    "viewer joined conversation"
                );
            }
        }
    }
}
