use serde::{Deserialize, Serialize};

use crate::domain::{Conversation, ConversationId, Member, Message, MessageId, UserId};

/// Frames a viewer sends over the push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinGroup {
        #[serde(rename = "groupId")]
        group_id: ConversationId,
    },
}

/// Events the relay pushes to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        #[serde(rename = "groupId")]
        group_id: ConversationId,
        message: Message,
    },
    GroupCreated {
        group: Conversation,
    },
    MemberJoined {
        #[serde(rename = "groupId")]
        group_id: ConversationId,
        member: Member,
    },
    MemberLeft {
        #[serde(rename = "groupId")]
        group_id: ConversationId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// Any `type` this build does not know. Receivers ignore it.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// The conversation this event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            ServerEvent::NewMessage { group_id, .. }
            | ServerEvent::MemberJoined { group_id, .. }
            | ServerEvent::MemberLeft { group_id, .. } => Some(group_id),
            ServerEvent::GroupCreated { .. } | ServerEvent::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::GroupCreated { .. } => "group_created",
            ServerEvent::MemberJoined { .. } => "member_joined",
            ServerEvent::MemberLeft { .. } => "member_left",
            ServerEvent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub text: String,
    pub source_guid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: UserId,
    pub nickname: String,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
