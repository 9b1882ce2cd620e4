use std::sync::Arc;

use gateway::Gateway;

use crate::{broadcast::BroadcastEmitter, registry::SubscriptionRouter};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) router: Arc<SubscriptionRouter>,
    pub(crate) emitter: BroadcastEmitter,
    pub(crate) outbox_capacity: usize,
}

impl AppState {
    pub(crate) fn new(gateway: Arc<dyn Gateway>, outbox_capacity: usize) -> Self {
        let router = Arc::new(SubscriptionRouter::new());
        Self {
            gateway,
            emitter: BroadcastEmitter::new(Arc::clone(&router)),
            router,
            outbox_capacity: outbox_capacity.max(1),
        }
    }
}
