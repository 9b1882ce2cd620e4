use std::{sync::Arc, time::Duration};

use gateway::{Gateway, GatewayError, DEFAULT_PAGE_LIMIT};
use shared::domain::ConversationId;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

use crate::{
    merge_cache::{MergeCache, MergeOutcome},
    viewport::ViewportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub page_size: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            page_size: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[derive(Clone)]
pub(crate) struct SnapshotPoller {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) cache: Arc<Mutex<MergeCache>>,
    pub(crate) conversation_id: ConversationId,
    pub(crate) config: PollConfig,
    pub(crate) events: broadcast::Sender<ViewportEvent>,
}

impl SnapshotPoller {
    /// Polls until the returned task is aborted. The first poll runs immediately.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = self.poll_once().await {
                    warn!(conversation_id = %self.conversation_id, %error, "snapshot poll failed");
                }
            }
        })
    }

    pub(crate) async fn poll_once(&self) -> Result<MergeOutcome, GatewayError> {
        let groups = self.gateway.fetch_groups().await?;
        let last_activity = groups
            .into_iter()
            .find(|group| group.id == self.conversation_id)
            .and_then(|group| group.last_activity);
        if let Some(last) = last_activity {
            if self
                .cache
                .lock()
                .await
                .contains(&self.conversation_id, &last.message_id)
            {
                debug!(conversation_id = %self.conversation_id, "cache already holds latest message");
                return Ok(MergeOutcome::default());
            }
        }

        let messages = self
            .gateway
            .fetch_messages(&self.conversation_id, None, self.config.page_size)
            .await?;
        let outcome = self
            .cache
            .lock()
            .await
            .apply_snapshot(&self.conversation_id, messages);
        if outcome.inserted > 0 {
            let _ = self.events.send(ViewportEvent::MessagesInserted {
                conversation_id: self.conversation_id.clone(),
                count: outcome.inserted,
            });
        }
        debug!(
            conversation_id = %self.conversation_id,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            "applied snapshot"
        );
        Ok(outcome)
    }
}
