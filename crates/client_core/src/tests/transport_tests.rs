use super::*;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;

#[test]
fn http_urls_map_onto_the_ws_endpoint() {
    assert_eq!(
        ws_url("http://127.0.0.1:8787").expect("url").as_str(),
        "ws://127.0.0.1:8787/ws"
    );
    assert_eq!(
        ws_url("https://relay.example.com/bridge/").expect("url").as_str(),
        "wss://relay.example.com/bridge/ws"
    );
    assert_eq!(
        ws_url("http://localhost:9000/?debug=1").expect("url").as_str(),
        "ws://localhost:9000/ws"
    );
}

#[test]
fn non_http_urls_are_rejected() {
    assert!(matches!(
        ws_url("ftp://relay.example.com"),
        Err(TransportError::InvalidUrl { .. })
    ));
    assert!(matches!(
        ws_url("not a url"),
        Err(TransportError::InvalidUrl { .. })
    ));
}

async fn echo(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(frame)) = socket.recv().await {
            match frame {
                AxumMessage::Text(text) => {
                    if socket
                        .send(AxumMessage::Text(format!("echo:{text}")))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                AxumMessage::Close(_) => break,
                _ => {}
            }
        }
    })
}

async fn spawn_echo_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let app = Router::new().route("/ws", get(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn ws_link_carries_frames_both_ways_and_closes_on_drop() {
    let server_url = spawn_echo_server().await;
    let connector = WsConnector::new(&server_url).expect("connector");
    let Link {
        outbound,
        mut inbound,
    } = connector.open().await.expect("open");

    outbound.send("ping".to_string()).await.expect("send");
    assert_eq!(inbound.recv().await.as_deref(), Some("echo:ping"));

    drop(outbound);
    let closed = tokio::time::timeout(std::time::Duration::from_secs(5), inbound.recv())
        .await
        .expect("link closes");
    assert!(closed.is_none());
}

#[tokio::test]
async fn open_fails_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let connector = WsConnector::new(&format!("http://{addr}")).expect("connector");
    assert!(matches!(
        connector.open().await,
        Err(TransportError::Connect(_))
    ));
}
