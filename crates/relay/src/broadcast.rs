use std::sync::Arc;

use shared::{
    domain::{Conversation, ConversationId, Member, Message, UserId},
    protocol::ServerEvent,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::SubscriptionRouter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Audience {
    Conversation(ConversationId),
    Everyone,
}

impl Audience {
    /// Creation events go to every viewer so group lists refresh; everything
    /// else only reaches viewers of the affected conversation.
    pub(crate) fn of(event: &ServerEvent) -> Option<Audience> {
        match event {
            ServerEvent::GroupCreated { .. } => Some(Audience::Everyone),
            ServerEvent::Unknown => None,
            scoped => scoped.conversation_id().cloned().map(Audience::Conversation),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeliveryReport {
    pub(crate) delivered: usize,
    pub(crate) missed: usize,
}

/// Fans write notifications out to routed connections.
#[derive(Clone)]
pub(crate) struct BroadcastEmitter {
    router: Arc<SubscriptionRouter>,
}

impl BroadcastEmitter {
    pub(crate) fn new(router: Arc<SubscriptionRouter>) -> Self {
        Self { router }
    }

    /// Spawns the fan-out and returns immediately; the write path never waits on it.
    pub(crate) fn emit(&self, event: ServerEvent) -> JoinHandle<DeliveryReport> {
        let emitter = self.clone();
        tokio::spawn(async move { emitter.deliver(event).await })
    }

    pub(crate) fn new_message(&self, message: Message) -> JoinHandle<DeliveryReport> {
        self.emit(ServerEvent::NewMessage {
            group_id: message.group_id.clone(),
            message,
        })
    }

    pub(crate) fn group_created(&self, group: Conversation) -> JoinHandle<DeliveryReport> {
        self.emit(ServerEvent::GroupCreated { group })
    }

    pub(crate) fn member_joined(
        &self,
        group_id: ConversationId,
        member: Member,
    ) -> JoinHandle<DeliveryReport> {
        self.emit(ServerEvent::MemberJoined { group_id, member })
    }

    pub(crate) fn member_left(
        &self,
        group_id: ConversationId,
        user_id: UserId,
    ) -> JoinHandle<DeliveryReport> {
        self.emit(ServerEvent::MemberLeft { group_id, user_id })
    }

    pub(crate) async fn deliver(&self, event: ServerEvent) -> DeliveryReport {
        let kind = event.kind();
        let Some(audience) = Audience::of(&event) else {
            debug!(kind, "event has no audience; not broadcast");
            return DeliveryReport::default();
        };
        let targets = match &audience {
            Audience::Conversation(conversation_id) => self.router.route(conversation_id).await,
            Audience::Everyone => self.router.everyone().await,
        };

        let mut report = DeliveryReport::default();
        for target in targets {
            match target.try_deliver(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    warn!(connection_id = %target.id, kind, reason, "route miss");
                    report.missed += 1;
                }
            }
        }
        debug!(
            kind,
            ?audience,
            delivered = report.delivered,
            missed = report.missed,
            "broadcast event"
        );
        report
    }
}

#[cfg(test)]
#[path = "tests/broadcast_tests.rs"]
mod tests;
