//! Client side of the bridge: the push session, the merge cache and the
//! viewport that keeps one conversation in sync.

pub mod merge_cache;
mod poller;
pub mod relay;
pub mod session;
pub mod transport;
pub mod viewport;

pub use merge_cache::{MergeCache, MergeError, MergeOutcome};
pub use poller::PollConfig;
pub use relay::RelayGateway;
pub use session::{ConnectionSession, RetryPolicy, SessionAction, SessionMachine, SessionState};
pub use transport::{Connector, Link, TransportError, WsConnector};
pub use viewport::{ConversationViewport, SyncClient, ViewportEvent};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
