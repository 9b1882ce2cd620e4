use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use shared::domain::{
    Conversation, ConversationId, GatewayStatus, LastActivity, Member, Message, MessageId, UserId,
    UserIdentity,
};
use tokio::sync::Mutex;

use crate::{page_limit, Gateway, GatewayError};

/// In-process stand-in for the external service. Used by tests and by the
/// relay's `memory` backend for local runs.
pub struct MemoryGateway {
    inner: Mutex<MemoryState>,
    message_fetches: AtomicUsize,
    group_fetches: AtomicUsize,
}

struct MemoryState {
    me: UserIdentity,
    connected: bool,
    groups: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    next_id: u64,
    fail_next_post: Option<String>,
}

impl MemoryGateway {
    pub fn new(me: UserIdentity) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                me,
                connected: true,
                groups: Vec::new(),
                messages: HashMap::new(),
                next_id: 1,
                fail_next_post: None,
            }),
            message_fetches: AtomicUsize::new(0),
            group_fetches: AtomicUsize::new(0),
        }
    }

    /// A gateway with one conversation, used by the relay's `memory` backend.
    pub async fn seeded() -> Self {
        let gateway = Self::new(UserIdentity {
            user_id: UserId::new("local-user"),
            name: "Local User".to_string(),
            email: None,
            image_url: None,
        });
        gateway
            .insert_group(Conversation {
                id: ConversationId::new("general"),
                name: "General".to_string(),
                description: Some("local sandbox conversation".to_string()),
                image_url: None,
                members: Vec::new(),
                last_activity: None,
            })
            .await;
        gateway
    }

    pub async fn insert_group(&self, conversation: Conversation) {
        let mut guard = self.inner.lock().await;
        guard
            .messages
            .entry(conversation.id.clone())
            .or_default();
        guard.groups.retain(|group| group.id != conversation.id);
        guard.groups.push(conversation);
    }

    /// Stores a message as if another participant had posted it upstream.
    pub async fn insert_message(&self, message: Message) {
        let mut guard = self.inner.lock().await;
        record_activity(&mut guard.groups, &message);
        guard
            .messages
            .entry(message.group_id.clone())
            .or_default()
            .push(message);
    }

    pub async fn set_connected(&self, connected: bool) {
        self.inner.lock().await.connected = connected;
    }

    pub async fn fail_next_post(&self, reason: impl Into<String>) {
        self.inner.lock().await.fail_next_post = Some(reason.into());
    }

    pub fn message_fetches(&self) -> usize {
        self.message_fetches.load(Ordering::Relaxed)
    }

    pub fn group_fetches(&self) -> usize {
        self.group_fetches.load(Ordering::Relaxed)
    }
}

fn record_activity(groups: &mut [Conversation], message: &Message) {
    let Some(group) = groups.iter_mut().find(|group| group.id == message.group_id) else {
        return;
    };
    let newer = group
        .last_activity
        .as_ref()
        .map_or(true, |last| last.created_at <= message.created_at);
    if newer {
        group.last_activity = Some(LastActivity {
            message_id: message.id.clone(),
            created_at: message.created_at,
        });
    }
}

fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn fetch_groups(&self) -> Result<Vec<Conversation>, GatewayError> {
        self.group_fetches.fetch_add(1, Ordering::Relaxed);
        let guard = self.inner.lock().await;
        if !guard.connected {
            return Err(GatewayError::Transport("memory gateway offline".into()));
        }
        Ok(guard.groups.clone())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        before_id: Option<&MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        self.message_fetches.fetch_add(1, Ordering::Relaxed);
        let guard = self.inner.lock().await;
        if !guard.connected {
            return Err(GatewayError::Transport("memory gateway offline".into()));
        }
        let stored = guard
            .messages
            .get(conversation_id)
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {conversation_id}")))?;

        let mut ordered: Vec<&Message> = stored.iter().collect();
        ordered.sort_by(|a, b| b.sort_cmp(a));
        if let Some(before_id) = before_id {
            let anchor = stored
                .iter()
                .find(|message| &message.id == before_id)
                .ok_or_else(|| GatewayError::NotFound(format!("message {before_id}")))?;
            ordered.retain(|message| message.sort_cmp(anchor).is_lt());
        }
        // Newest first, like the upstream.
        Ok(ordered
            .into_iter()
            .take(page_limit(Some(limit)) as usize)
            .cloned()
            .collect())
    }

    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        source_guid: &str,
    ) -> Result<Message, GatewayError> {
        let mut guard = self.inner.lock().await;
        if let Some(reason) = guard.fail_next_post.take() {
            return Err(GatewayError::Upstream {
                status: 500,
                message: reason,
            });
        }
        if !guard.connected {
            return Err(GatewayError::Transport("memory gateway offline".into()));
        }
        if text.trim().is_empty() {
            return Err(GatewayError::Invalid("message text is empty".into()));
        }
        if !guard.messages.contains_key(conversation_id) {
            return Err(GatewayError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }

        let id = MessageId::new(format!("m{}", guard.next_id));
        guard.next_id += 1;
        let message = Message {
            id,
            source_guid: Some(source_guid.to_string()),
            user_id: guard.me.user_id.clone(),
            name: guard.me.name.clone(),
            text: Some(text.to_string()),
            attachments: Vec::new(),
            system: false,
            created_at: now_seconds(),
            group_id: conversation_id.clone(),
        };
        record_activity(&mut guard.groups, &message);
        guard
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn fetch_current_user(&self) -> Result<UserIdentity, GatewayError> {
        Ok(self.inner.lock().await.me.clone())
    }

    async fn check_status(&self) -> Result<GatewayStatus, GatewayError> {
        Ok(GatewayStatus {
            connected: self.inner.lock().await.connected,
        })
    }

    async fn create_group(&self, name: &str) -> Result<Conversation, GatewayError> {
        if name.trim().is_empty() {
            return Err(GatewayError::Invalid("group name is empty".into()));
        }
        let mut guard = self.inner.lock().await;
        let id = ConversationId::new(format!("g{}", guard.next_id));
        guard.next_id += 1;
        let conversation = Conversation {
            id: id.clone(),
            name: name.trim().to_string(),
            description: None,
            image_url: None,
            members: vec![Member {
                membership_id: None,
                user_id: guard.me.user_id.clone(),
                nickname: guard.me.name.clone(),
                image_url: None,
            }],
            last_activity: None,
        };
        guard.groups.push(conversation.clone());
        guard.messages.insert(id, Vec::new());
        Ok(conversation)
    }

    async fn add_member(
        &self,
        conversation_id: &ConversationId,
        member: Member,
    ) -> Result<Member, GatewayError> {
        let mut guard = self.inner.lock().await;
        let group = guard
            .groups
            .iter_mut()
            .find(|group| &group.id == conversation_id)
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {conversation_id}")))?;
        group
            .members
            .retain(|existing| existing.user_id != member.user_id);
        group.members.push(member.clone());
        Ok(member)
    }

    async fn remove_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), GatewayError> {
        let mut guard = self.inner.lock().await;
        let group = guard
            .groups
            .iter_mut()
            .find(|group| &group.id == conversation_id)
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {conversation_id}")))?;
        let before = group.members.len();
        group.members.retain(|member| &member.user_id != user_id);
        if group.members.len() == before {
            return Err(GatewayError::NotFound(format!("member {user_id}")));
        }
        Ok(())
    }
}
