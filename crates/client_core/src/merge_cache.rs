use std::collections::{HashMap, HashSet};

use shared::domain::{ConversationId, Message, MessageId};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("malformed message {message_id:?}: {reason}")]
    Malformed {
        message_id: String,
        reason: &'static str,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
struct ConversationLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    viewers: usize,
}

impl ConversationLog {
    fn insert(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|existing| existing.sort_cmp(&message).is_lt());
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }
}

/// Ordered, deduplicated messages per retained conversation.
#[derive(Debug, Default)]
pub struct MergeCache {
    logs: HashMap<ConversationId, ConversationLog>,
}

impl MergeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, conversation_id: &ConversationId) {
        self.logs
            .entry(conversation_id.clone())
            .or_default()
            .viewers += 1;
    }

    /// Returns `true` when this was the last viewer and the entry was discarded.
    pub fn release(&mut self, conversation_id: &ConversationId) -> bool {
        let Some(log) = self.logs.get_mut(conversation_id) else {
            return false;
        };
        log.viewers = log.viewers.saturating_sub(1);
        if log.viewers == 0 {
            self.logs.remove(conversation_id);
            return true;
        }
        false
    }

    pub fn is_tracked(&self, conversation_id: &ConversationId) -> bool {
        self.logs.contains_key(conversation_id)
    }

    pub fn viewers(&self, conversation_id: &ConversationId) -> usize {
        self.logs.get(conversation_id).map_or(0, |log| log.viewers)
    }

    pub fn apply_snapshot(
        &mut self,
        conversation_id: &ConversationId,
        messages: impl IntoIterator<Item = Message>,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let Some(log) = self.logs.get_mut(conversation_id) else {
            debug!(conversation_id = %conversation_id, "snapshot for unwatched conversation dropped");
            return outcome;
        };
        for message in messages {
            if let Err(error) = validate(conversation_id, &message) {
                warn!(conversation_id = %conversation_id, %error, "rejecting snapshot entry");
                outcome.rejected += 1;
                continue;
            }
            if log.insert(message) {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        outcome
    }

    /// Returns `Ok(true)` if the message was new.
    pub fn apply_delta(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> Result<bool, MergeError> {
        if let Err(error) = validate(conversation_id, &message) {
            warn!(conversation_id = %conversation_id, %error, "rejecting delta");
            return Err(error);
        }
        let Some(log) = self.logs.get_mut(conversation_id) else {
            debug!(conversation_id = %conversation_id, "delta for unwatched conversation dropped");
            return Ok(false);
        };
        Ok(log.insert(message))
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.logs
            .get(conversation_id)
            .map_or(&[][..], |log| log.messages.as_slice())
    }

    pub fn contains(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.logs
            .get(conversation_id)
            .is_some_and(|log| log.ids.contains(message_id))
    }

    pub fn oldest(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.messages(conversation_id).first()
    }

    pub fn latest(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.messages(conversation_id).last()
    }
}

fn validate(conversation_id: &ConversationId, message: &Message) -> Result<(), MergeError> {
    let reason = message.malformed_reason().or_else(|| {
        (&message.group_id != conversation_id).then_some("belongs to another conversation")
    });
    match reason {
        Some(reason) => Err(MergeError::Malformed {
            message_id: message.id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
#[path = "tests/merge_cache_tests.rs"]
mod tests;
