use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::domain::{
    Conversation, ConversationId, GatewayStatus, LastActivity, Member, Message, MessageId, UserId,
    UserIdentity,
};
use tracing::{debug, warn};

use crate::{page_limit, Gateway, GatewayError};

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub access_token: String,
}

/// Talks to the upstream REST API, which wraps every payload in
/// `{"response": ..., "meta": {...}}` and authenticates with a `token` query parameter.
#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    base_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: Option<T>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamGroup {
    id: ConversationId,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    members: Vec<Member>,
    #[serde(default)]
    messages: Option<UpstreamMessageSummary>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessageSummary {
    #[serde(default)]
    last_message_id: Option<MessageId>,
    #[serde(default)]
    last_message_created_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessagePage {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct UpstreamPosted {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct UpstreamUser {
    id: UserId,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    source_guid: &'a str,
    text: &'a str,
    attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct PostMessageBody<'a> {
    message: OutboundMessage<'a>,
}

#[derive(Debug, Serialize)]
struct CreateGroupBody<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct AddMembersBody {
    members: Vec<Member>,
}

impl From<UpstreamGroup> for Conversation {
    fn from(group: UpstreamGroup) -> Self {
        let last_activity = group.messages.and_then(|summary| {
            let message_id = summary.last_message_id?;
            let created_at = DateTime::<Utc>::from_timestamp(summary.last_message_created_at?, 0)?;
            Some(LastActivity {
                message_id,
                created_at,
            })
        });
        Conversation {
            id: group.id,
            name: group.name,
            description: group.description,
            image_url: group.image_url,
            members: group.members,
            last_activity,
        }
    }
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        }
    }

    /// Appends each segment percent-encoded, so ids never reshape the path.
    fn endpoint<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| GatewayError::Invalid(format!("upstream url {}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| {
                GatewayError::Invalid(format!("upstream url {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.query(&[("token", self.access_token.as_str())])
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Option<T>, GatewayError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(what, "upstream reported no changes");
            return Ok(None);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(what.to_string()));
        }
        let body = response.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.meta)
                .map(|meta| meta.errors.join("; "))
                .filter(|joined| !joined.is_empty())
                .unwrap_or_else(|| status.to_string());
            warn!(what, status = status.as_u16(), %message, "upstream call failed");
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        if body.is_empty() {
            return Ok(None);
        }
        let envelope: Envelope<T> = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::Decode(format!("{what}: {err}")))?;
        Ok(envelope.response)
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, GatewayError> {
        self.call(request, what)
            .await?
            .ok_or_else(|| GatewayError::Decode(format!("{what}: empty response")))
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn fetch_groups(&self) -> Result<Vec<Conversation>, GatewayError> {
        let request = self
            .http
            .get(self.endpoint(["groups"])?)
            .query(&[("per_page", "100")]);
        let groups: Vec<UpstreamGroup> = self.call(request, "groups").await?.unwrap_or_default();
        Ok(groups.into_iter().map(Conversation::from).collect())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before_id: Option<&MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        let mut request = self
            .http
            .get(self.endpoint(["groups", conversation_id.as_str(), "messages"])?)
            .query(&[("limit", page_limit(Some(limit)).to_string())]);
        if let Some(before_id) = before_id {
            request = request.query(&[("before_id", before_id.as_str())]);
        }
        let page: Option<UpstreamMessagePage> = self.call(request, "messages").await?;
        Ok(page.map(|page| page.messages).unwrap_or_default())
    }

    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        source_guid: &str,
    ) -> Result<Message, GatewayError> {
        if text.trim().is_empty() {
            return Err(GatewayError::Invalid("message text is empty".into()));
        }
        let request = self
            .http
            .post(self.endpoint(["groups", conversation_id.as_str(), "messages"])?)
            .json(&PostMessageBody {
                message: OutboundMessage {
                    source_guid,
                    text,
                    attachments: Vec::new(),
                },
            });
        let posted: UpstreamPosted = self.call_required(request, "post message").await?;
        Ok(posted.message)
    }

    async fn fetch_current_user(&self) -> Result<UserIdentity, GatewayError> {
        let request = self.http.get(self.endpoint(["users", "me"])?);
        let user: UpstreamUser = self.call_required(request, "current user").await?;
        Ok(UserIdentity {
            user_id: user.id,
            name: user.name,
            email: user.email,
            image_url: user.image_url,
        })
    }

    async fn check_status(&self) -> Result<GatewayStatus, GatewayError> {
        match self.fetch_current_user().await {
            Ok(_) => Ok(GatewayStatus { connected: true }),
            Err(err) if err.is_retryable() => {
                debug!(%err, "upstream unreachable");
                Ok(GatewayStatus { connected: false })
            }
            Err(GatewayError::Upstream { status: 401, .. }) => {
                Ok(GatewayStatus { connected: false })
            }
            Err(err) => Err(err),
        }
    }

    async fn create_group(&self, name: &str) -> Result<Conversation, GatewayError> {
        let request = self
            .http
            .post(self.endpoint(["groups"])?)
            .json(&CreateGroupBody { name });
        let group: UpstreamGroup = self.call_required(request, "create group").await?;
        Ok(group.into())
    }

    async fn add_member(
        &self,
        conversation_id: &ConversationId,
        member: Member,
    ) -> Result<Member, GatewayError> {
        let request = self
            .http
            .post(self.endpoint(["groups", conversation_id.as_str(), "members", "add"])?)
            .json(&AddMembersBody {
                members: vec![member.clone()],
            });
        self.call::<serde_json::Value>(request, "add member").await?;
        Ok(member)
    }

    async fn remove_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), GatewayError> {
        // The upstream removes by membership id, which only the roster knows.
        let request = self
            .http
            .get(self.endpoint(["groups", conversation_id.as_str()])?);
        let group: UpstreamGroup = self.call_required(request, "group").await?;
        let membership_id = group
            .members
            .into_iter()
            .find(|member| &member.user_id == user_id)
            .and_then(|member| member.membership_id)
            .ok_or_else(|| GatewayError::NotFound(format!("member {user_id}")))?;
        let request = self.http.post(self.endpoint([
            "groups",
            conversation_id.as_str(),
            "members",
            membership_id.as_str(),
            "remove",
        ])?);
        self.call::<serde_json::Value>(request, "remove member").await?;
        Ok(())
    }
}
