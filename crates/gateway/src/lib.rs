//! Adapter seam between the bridge and the external group-chat service.
//!
//! Everything above this crate speaks [`Gateway`]; the service's own request
//! and response shapes stay behind the implementations.

use async_trait::async_trait;
use shared::domain::{
    Conversation, ConversationId, GatewayStatus, Member, Message, MessageId, UserId, UserIdentity,
};
use thiserror::Error;

mod http;
mod memory;

pub use http::{HttpGateway, HttpGatewayConfig};
pub use memory::MemoryGateway;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("operation not supported by this gateway: {0}")]
    Unsupported(&'static str),
}

impl GatewayError {
    /// Whether a caller may reasonably try the same call again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return GatewayError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return GatewayError::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        GatewayError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn fetch_groups(&self) -> Result<Vec<Conversation>, GatewayError>;

    /// Messages of one conversation, optionally strictly older than `before_id`.
    /// Order is unspecified; callers re-sort.
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before_id: Option<&MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError>;

    /// Posts a message and returns the canonical echo with its server-assigned id.
    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        source_guid: &str,
    ) -> Result<Message, GatewayError>;

    async fn fetch_current_user(&self) -> Result<UserIdentity, GatewayError>;

    async fn check_status(&self) -> Result<GatewayStatus, GatewayError>;

    async fn create_group(&self, _name: &str) -> Result<Conversation, GatewayError> {
        Err(GatewayError::Unsupported("create_group"))
    }

    async fn add_member(
        &self,
        _conversation_id: &ConversationId,
        _member: Member,
    ) -> Result<Member, GatewayError> {
        Err(GatewayError::Unsupported("add_member"))
    }

    async fn remove_member(
        &self,
        _conversation_id: &ConversationId,
        _user_id: &UserId,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Unsupported("remove_member"))
    }
}

/// Clamps a caller-supplied page size into the range upstreams accept.
pub fn page_limit(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT)
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod memory_tests;

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod http_tests;
