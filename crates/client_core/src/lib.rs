use shared::domain::{ConversationKey, LocalId};
use tokio::task::JoinHandle;

pub mod backend;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod delivery;
pub mod error;
pub mod guard;
pub mod reconcile;
pub mod refresh;
pub mod session;
pub mod transport;

pub use backend::{ChatBackend, MissingChatBackend, RestChatBackend};
pub use config::{load_settings, ClientSettings};
pub use connection::{ChannelConnection, ConnectionSettings, ConnectionSignal, ConnectionState};
pub use credentials::{
    CredentialPair, CredentialStore, FileTokenStorage, MemoryTokenStorage, TokenStorage,
};
pub use delivery::{DeliveryEngine, OutboundEnvelope, RetryPolicy};
pub use error::{ClientError, ClientResult};
pub use guard::{GuardedRequest, RequestGuard};
pub use reconcile::{ApplyOutcome, InboundMessage, InboundReconciler, TimelineEntry};
pub use refresh::RefreshCoordinator;
pub use session::ChatSession;
pub use transport::{
    ConnectAuth, MissingRealtimeConnector, RealtimeConnector, RealtimeTransport, TransportEvent,
    WsConnector,
};

/// Where the UI should send the user once the session has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRedirect {
    Home,
    Login,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Emitted once per session when credentials are gone for good.
    SessionExpired {
        redirect: SessionRedirect,
    },
    CredentialsRefreshed,
    ConnectionStateChanged(ConnectionState),
    TimelineUpdated {
        conversation: ConversationKey,
    },
    DeliveryAcknowledged {
        local_id: LocalId,
    },
    DeliveryFailed {
        local_id: LocalId,
        reason: String,
    },
    /// The session ended while the send was in flight. The entry stays
    /// pending and is not retried.
    DeliveryAbandoned {
        conversation: ConversationKey,
        local_id: LocalId,
    },
    Error(String),
}

/// Owns a background task and aborts it when dropped, so tasks tied to a
/// session or connection cannot outlive it.
#[derive(Debug)]
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Releases ownership without aborting. Used by a task that is about to
    /// end on its own and must not abort itself.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
