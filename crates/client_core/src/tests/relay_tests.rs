use super::*;
use crate::merge_cache::{MergeCache, MergeOutcome};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::net::TcpListener;

async fn list_messages(
    Path(group_id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    if group_id == "patchy" {
        return Ok(Json(json!([
            { "id": "m1", "user_id": "u1", "name": "alice", "created_at": 1_700_000_001, "group_id": "patchy" },
            { "id": "m2", "user_id": "u1", "name": "alice", "text": "no timestamp", "group_id": "patchy" }
        ])));
    }
    if group_id == "missing" {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(ErrorCode::NotFound, "conversation missing not found")),
        ));
    }
    Ok(Json(json!([{
        "id": "m5",
        "user_id": "u1",
        "name": "alice",
        "text": format!(
            "limit={} before={}",
            q.get("limit").cloned().unwrap_or_default(),
            q.get("before_id").cloned().unwrap_or_default()
        ),
        "created_at": 1_700_000_500,
        "group_id": group_id,
    }])))
}

async fn post_message(
    Path(group_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<ApiError>)> {
    if group_id == "broken" {
        return Err((
            StatusCode::BAD_GATEWAY,
            Json(ApiError::new(ErrorCode::Upstream, "upstream returned 500: boom")),
        ));
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": "m1",
            "source_guid": body["source_guid"],
            "user_id": "u-me",
            "name": "me",
            "text": body["text"],
            "created_at": 1_700_000_001,
            "group_id": group_id,
        })),
    ))
}

async fn remove_member(Path((_group_id, user_id)): Path<(String, String)>) -> StatusCode {
    if user_id == "u-ghost" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn spawn_mock_relay() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let app = Router::new()
        .route(
            "/groups",
            get(|| async { Json(json!([{ "id": "g1", "name": "climbing" }])) }),
        )
        .route(
            "/groups/:group_id/messages",
            get(list_messages).post(post_message),
        )
        .route(
            "/groups/:group_id/members/:user_id",
            delete(remove_member),
        )
        .route(
            "/groups/:group_id/members",
            post(|| async {
                (
                    StatusCode::NOT_IMPLEMENTED,
                    Json(ApiError::new(ErrorCode::Unsupported, "add_member")),
                )
            }),
        )
        .route("/status", get(|| async { Json(json!({ "connected": true })) }));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn reads_go_through_the_relay_surface() {
    let relay = RelayGateway::new(spawn_mock_relay().await);

    let groups = relay.fetch_groups().await.expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, ConversationId::new("g1"));
    assert!(groups[0].members.is_empty());

    let page = relay
        .fetch_messages(&ConversationId::new("g1"), Some(&MessageId::new("m9")), 7)
        .await
        .expect("messages");
    assert_eq!(page[0].text.as_deref(), Some("limit=7 before=m9"));

    assert!(relay.check_status().await.expect("status").connected);
}

#[tokio::test]
async fn post_returns_the_canonical_echo() {
    let relay = RelayGateway::new(spawn_mock_relay().await);
    let echo = relay
        .post_message(&ConversationId::new("g1"), "hello", "t1")
        .await
        .expect("post");
    assert_eq!(echo.id, MessageId::new("m1"));
    assert_eq!(echo.source_guid.as_deref(), Some("t1"));
    assert_eq!(echo.text.as_deref(), Some("hello"));
}

#[tokio::test]
async fn relay_error_envelopes_become_gateway_errors() {
    let relay = RelayGateway::new(spawn_mock_relay().await);

    let err = relay
        .fetch_messages(&ConversationId::new("missing"), None, 20)
        .await
        .expect_err("missing");
    assert!(matches!(err, GatewayError::NotFound(_)));

    let err = relay
        .post_message(&ConversationId::new("broken"), "hello", "t2")
        .await
        .expect_err("broken");
    match err {
        GatewayError::Upstream { status, message } => {
            assert_eq!(status, 502);
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = relay
        .add_member(
            &ConversationId::new("g1"),
            Member {
                membership_id: None,
                user_id: UserId::new("u2"),
                nickname: "bob".into(),
                image_url: None,
            },
        )
        .await
        .expect_err("unsupported");
    assert!(matches!(err, GatewayError::Unsupported(_)));
}

#[tokio::test]
async fn remove_member_accepts_no_content() {
    let relay = RelayGateway::new(spawn_mock_relay().await);
    relay
        .remove_member(&ConversationId::new("g1"), &UserId::new("u2"))
        .await
        .expect("removed");
    let err = relay
        .remove_member(&ConversationId::new("g1"), &UserId::new("u-ghost"))
        .await
        .expect_err("ghost");
    assert!(matches!(err, GatewayError::Upstream { status: 404, .. }));
}

#[tokio::test]
async fn a_page_with_one_bad_entry_still_merges_the_rest() {
    let relay = RelayGateway::new(spawn_mock_relay().await);
    let conversation = ConversationId::new("patchy");
    let page = relay
        .fetch_messages(&conversation, None, 20)
        .await
        .expect("page decodes");

    let mut cache = MergeCache::new();
    cache.retain(&conversation);
    let outcome = cache.apply_snapshot(&conversation, page);
    assert_eq!(
        outcome,
        MergeOutcome {
            inserted: 1,
            duplicates: 0,
            rejected: 1
        }
    );
    assert!(cache.contains(&conversation, &MessageId::new("m1")));
}

#[tokio::test]
async fn path_ids_stay_inside_their_segment() {
    let relay = RelayGateway::new(spawn_mock_relay().await);
    let tricky = ConversationId::new("g1/members?x");
    let page = relay
        .fetch_messages(&tricky, None, 3)
        .await
        .expect("messages");
    assert_eq!(page[0].group_id, tricky);
}
