use async_trait::async_trait;
use gateway::{Gateway, GatewayError};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{
        Conversation, ConversationId, GatewayStatus, Member, Message, MessageId, UserId,
        UserIdentity,
    },
    error::{ApiError, ErrorCode},
    protocol::{AddMemberRequest, CreateGroupRequest, PostMessageRequest},
};
use url::Url;

/// [`Gateway`] over a relay's HTTP surface, so viewers share the relay's
/// upstream credentials and every write is broadcast to other viewers.
pub struct RelayGateway {
    http: Client,
    server_url: String,
}

impl RelayGateway {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|err| GatewayError::Invalid(format!("relay url {}: {err}", self.server_url)))?;
        url.path_segments_mut()
            .map_err(|()| {
                GatewayError::Invalid(format!("relay url {} cannot take a path", self.server_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let response = ensure_success(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|err| GatewayError::Decode(err.to_string()))
}

async fn ensure_success(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let Ok(api_error) = serde_json::from_str::<ApiError>(&body) else {
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            message: body,
        });
    };
    Err(match api_error.code {
        ErrorCode::NotFound => GatewayError::NotFound(api_error.message),
        ErrorCode::Validation => GatewayError::Invalid(api_error.message),
        ErrorCode::Unsupported => GatewayError::Unsupported("operation disabled on relay"),
        _ => GatewayError::Upstream {
            status: status.as_u16(),
            message: api_error.message,
        },
    })
}

#[async_trait]
impl Gateway for RelayGateway {
    async fn fetch_groups(&self) -> Result<Vec<Conversation>, GatewayError> {
        let response = self.http.get(self.url(["groups"])?).send().await?;
        decode(response).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before_id: Option<&MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before_id) = before_id {
            query.push(("before_id", before_id.to_string()));
        }
        let response = self
            .http
            .get(self.url(["groups", conversation_id.as_str(), "messages"])?)
            .query(&query)
            .send()
            .await?;
        decode(response).await
    }

    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        source_guid: &str,
    ) -> Result<Message, GatewayError> {
        let response = self
            .http
            .post(self.url(["groups", conversation_id.as_str(), "messages"])?)
            .json(&PostMessageRequest {
                text: text.to_string(),
                source_guid: source_guid.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn fetch_current_user(&self) -> Result<UserIdentity, GatewayError> {
        let response = self.http.get(self.url(["me"])?).send().await?;
        decode(response).await
    }

    async fn check_status(&self) -> Result<GatewayStatus, GatewayError> {
        let response = self.http.get(self.url(["status"])?).send().await?;
        decode(response).await
    }

    async fn create_group(&self, name: &str) -> Result<Conversation, GatewayError> {
        let response = self
            .http
            .post(self.url(["groups"])?)
            .json(&CreateGroupRequest {
                name: name.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn add_member(
        &self,
        conversation_id: &ConversationId,
        member: Member,
    ) -> Result<Member, GatewayError> {
        let response = self
            .http
            .post(self.url(["groups", conversation_id.as_str(), "members"])?)
            .json(&AddMemberRequest {
                user_id: member.user_id,
                nickname: member.nickname,
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn remove_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), GatewayError> {
        let response = self
            .http
            .delete(self.url([
                "groups",
                conversation_id.as_str(),
                "members",
                user_id.as_str(),
            ])?)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
