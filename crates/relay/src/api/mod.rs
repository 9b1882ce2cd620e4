//! Thin HTTP pass-through to the gateway. Successful writes are announced to
//! subscribed viewers through the broadcast emitter.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use gateway::{page_limit, GatewayError};
use shared::{
    domain::{Conversation, ConversationId, GatewayStatus, Member, Message, UserId, UserIdentity},
    error::{ApiError, ErrorCode},
    protocol::{AddMemberRequest, CreateGroupRequest, ListMessagesQuery, PostMessageRequest},
};
use tracing::{info, warn};

use crate::app_state::AppState;

pub(crate) type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub(crate) async fn list_groups(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Conversation>>> {
    let groups = state.gateway.fetch_groups().await.map_err(gateway_failure)?;
    Ok(Json(groups))
}

pub(crate) async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Query(q): Query<ListMessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let conversation_id = ConversationId::new(group_id);
    let messages = state
        .gateway
        .fetch_messages(&conversation_id, q.before_id.as_ref(), page_limit(q.limit))
        .await
        .map_err(gateway_failure)?;
    Ok(Json(messages))
}

pub(crate) async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    if req.text.trim().is_empty() {
        return Err(validation("text cannot be empty"));
    }
    if req.source_guid.trim().is_empty() {
        return Err(validation("source_guid cannot be empty"));
    }

    let conversation_id = ConversationId::new(group_id);
    let message = state
        .gateway
        .post_message(&conversation_id, &req.text, &req.source_guid)
        .await
        .map_err(|err| {
            warn!(
                conversation_id = %conversation_id,
                source_guid = %req.source_guid,
                %err,
                "upstream write failed"
            );
            gateway_failure(err)
        })?;
    info!(
        conversation_id = %conversation_id,
        message_id = %message.id,
        "message posted"
    );
    state.emitter.new_message(message.clone());
    Ok((StatusCode::CREATED, Json(message)))
}

pub(crate) async fn status(State(state): State<Arc<AppState>>) -> Json<GatewayStatus> {
    match state.gateway.check_status().await {
        Ok(status) => Json(status),
        Err(err) => {
            warn!(%err, "status check failed");
            Json(GatewayStatus { connected: false })
        }
    }
}

pub(crate) async fn current_user(State(state): State<Arc<AppState>>) -> ApiResult<Json<UserIdentity>> {
    let me = state
        .gateway
        .fetch_current_user()
        .await
        .map_err(gateway_failure)?;
    Ok(Json(me))
}

pub(crate) async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    if req.name.trim().is_empty() {
        return Err(validation("name cannot be empty"));
    }
    let group = state
        .gateway
        .create_group(&req.name)
        .await
        .map_err(gateway_failure)?;
    state.emitter.group_created(group.clone());
    Ok((StatusCode::CREATED, Json(group)))
}

pub(crate) async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<Member>)> {
    if req.user_id.is_empty() {
        return Err(validation("user_id cannot be empty"));
    }
    let conversation_id = ConversationId::new(group_id);
    let member = state
        .gateway
        .add_member(
            &conversation_id,
            Member {
                membership_id: None,
                user_id: req.user_id,
                nickname: req.nickname,
                image_url: None,
            },
        )
        .await
        .map_err(gateway_failure)?;
    state
        .emitter
        .member_joined(conversation_id, member.clone());
    Ok((StatusCode::CREATED, Json(member)))
}

pub(crate) async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((group_id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let conversation_id = ConversationId::new(group_id);
    let user_id = UserId::new(user_id);
    state
        .gateway
        .remove_member(&conversation_id, &user_id)
        .await
        .map_err(gateway_failure)?;
    state.emitter.member_left(conversation_id, user_id);
    Ok(StatusCode::NO_CONTENT)
}

fn validation(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

pub(crate) fn gateway_failure(err: GatewayError) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match &err {
        GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
        GatewayError::Invalid(_) => (StatusCode::BAD_REQUEST, ErrorCode::Validation),
        GatewayError::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, ErrorCode::Unsupported),
        GatewayError::Upstream { status: 401, .. } => {
            (StatusCode::BAD_GATEWAY, ErrorCode::Unauthorized)
        }
        GatewayError::Upstream { status: 429, .. } => {
            (StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited)
        }
        GatewayError::Upstream { .. } | GatewayError::Transport(_) | GatewayError::Decode(_) => {
            (StatusCode::BAD_GATEWAY, ErrorCode::Upstream)
        }
    };
    (status, Json(ApiError::new(code, err.to_string())))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
