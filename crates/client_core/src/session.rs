use std::sync::{Arc, Weak};

use chrono::Utc;
use reqwest::Client;
use shared::{
    domain::{ChannelId, ConversationKey, UserId},
    protocol::{DirectThread, InboundEvent},
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::{ChatBackend, RestChatBackend},
    config::ClientSettings,
    connection::{ChannelConnection, ConnectionSettings, ConnectionSignal, ConnectionState},
    credentials::{CredentialPair, CredentialStore, FileTokenStorage, MemoryTokenStorage, TokenStorage},
    delivery::{DeliveryEngine, OutboundEnvelope, RetryPolicy},
    error::{ClientError, ClientResult},
    guard::RequestGuard,
    reconcile::{direct_conversation, InboundMessage, InboundReconciler, ReconcilerSettings, TimelineEntry},
    refresh::RefreshCoordinator,
    transport::{RealtimeConnector, WsConnector},
    ClientEvent, Subscription,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything one logged-in user needs: guarded REST access, the realtime
/// connection, delivery and the merged timelines.
pub struct ChatSession {
    settings: ClientSettings,
    user_id: UserId,
    guard: Arc<RequestGuard>,
    backend: Arc<dyn ChatBackend>,
    connection: Arc<ChannelConnection>,
    reconciler: Arc<Mutex<InboundReconciler>>,
    delivery: DeliveryEngine,
    events: broadcast::Sender<ClientEvent>,
    signals: Arc<Mutex<mpsc::UnboundedReceiver<ConnectionSignal>>>,
    tasks: Mutex<Vec<Subscription>>,
}

impl ChatSession {
    /// Builds a session against the configured REST and websocket endpoints.
    /// Persisted credentials are restored when `credentials_path` is set.
    pub fn new(settings: ClientSettings, user_id: UserId) -> ClientResult<Arc<Self>> {
        let storage: Arc<dyn TokenStorage> = match &settings.credentials_path {
            Some(path) => Arc::new(FileTokenStorage::new(path)),
            None => Arc::new(MemoryTokenStorage::new()),
        };
        let credentials = Arc::new(CredentialStore::load(storage)?);
        let connector = Arc::new(WsConnector::new(settings.resolved_realtime_url()?));
        let http = build_http(&settings)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let guard = build_guard(&settings, http, credentials.clone(), events.clone());
        let backend = Arc::new(RestChatBackend::new(guard.clone()));
        Ok(Self::assemble(settings, user_id, guard, connector, backend, events))
    }

    /// Same as `new`, with the credential store, socket connector and REST
    /// backend supplied by the caller.
    pub fn new_with_dependencies(
        settings: ClientSettings,
        user_id: UserId,
        credentials: Arc<CredentialStore>,
        connector: Arc<dyn RealtimeConnector>,
        backend: Arc<dyn ChatBackend>,
    ) -> ClientResult<Arc<Self>> {
        let http = build_http(&settings)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let guard = build_guard(&settings, http, credentials, events.clone());
        Ok(Self::assemble(settings, user_id, guard, connector, backend, events))
    }

    fn assemble(
        settings: ClientSettings,
        user_id: UserId,
        guard: Arc<RequestGuard>,
        connector: Arc<dyn RealtimeConnector>,
        backend: Arc<dyn ChatBackend>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let (connection, signals) = ChannelConnection::new(
            connector,
            guard.credentials().clone(),
            user_id.clone(),
            ConnectionSettings::from(&settings),
            events.clone(),
        );
        let reconciler = Arc::new(Mutex::new(InboundReconciler::new(
            ReconcilerSettings::from(&settings),
        )));
        let delivery = DeliveryEngine::new(
            connection.clone(),
            reconciler.clone(),
            backend.clone(),
            events.clone(),
            RetryPolicy::from(&settings),
        );
        Arc::new(Self {
            settings,
            user_id,
            guard,
            backend,
            connection,
            reconciler,
            delivery,
            events,
            signals: Arc::new(Mutex::new(signals)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        self.guard.credentials()
    }

    /// Guarded REST access for callers outside the chat flow.
    pub fn request_guard(&self) -> &Arc<RequestGuard> {
        &self.guard
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn login(&self, pair: CredentialPair) {
        self.credentials().replace(pair).await;
        info!(user_id = %self.user_id, "auth: logged in");
    }

    /// Starts background work and opens the realtime connection. Calling it
    /// again while running only reconnects.
    pub async fn start(self: &Arc<Self>) -> ClientResult<()> {
        if !self.credentials().has_session().await {
            return Err(ClientError::AuthExpired);
        }
        {
            let mut tasks = self.tasks.lock().await;
            if tasks.is_empty() {
                tasks.push(self.spawn_dispatcher());
                tasks.push(
                    self.guard
                        .refresh()
                        .spawn_proactive_refresh(self.settings.proactive_refresh_skew()),
                );
            }
        }
        self.connection.connect().await
    }

    /// Joins `channel_id` and merges its recent history. Returns the
    /// channel's timeline.
    pub async fn open_channel(&self, channel_id: ChannelId) -> ClientResult<Vec<TimelineEntry>> {
        self.connection.join_channel(channel_id.clone()).await?;
        self.resync_channel(&channel_id).await?;
        Ok(self.timeline(&ConversationKey::Channel(channel_id)).await)
    }

    /// Sends to the active channel.
    pub async fn send_message(&self, content: &str) -> ClientResult<OutboundEnvelope> {
        let channel_id = self
            .connection
            .active_channel()
            .await
            .ok_or_else(|| ClientError::Validation("no channel is open".into()))?;
        self.delivery.send(channel_id, content).await
    }

    pub async fn send_direct_message(
        &self,
        receiver_id: UserId,
        content: &str,
    ) -> ClientResult<OutboundEnvelope> {
        if receiver_id == self.user_id {
            return Err(ClientError::Validation("cannot message yourself".into()));
        }
        self.delivery.send_direct(receiver_id, content).await
    }

    /// Fetches DM threads and merges each one into its conversation.
    pub async fn load_direct_threads(&self) -> ClientResult<Vec<DirectThread>> {
        let threads = self.backend.fetch_direct_threads().await?;
        let now = Utc::now();
        let mut touched = Vec::new();
        {
            let mut reconciler = self.reconciler.lock().await;
            for thread in &threads {
                for message in &thread.messages {
                    let key = direct_conversation(&self.user_id, message);
                    let outcome =
                        reconciler.apply(key.clone(), InboundMessage::from_direct(message.clone()), now);
                    if outcome.changed_timeline() && !touched.contains(&key) {
                        touched.push(key);
                    }
                }
            }
        }
        for conversation in touched {
            let _ = self.events.send(ClientEvent::TimelineUpdated { conversation });
        }
        Ok(threads)
    }

    pub async fn timeline(&self, conversation: &ConversationKey) -> Vec<TimelineEntry> {
        self.reconciler.lock().await.timeline(conversation).to_vec()
    }

    /// Closes the connection and stops background work. The session can be
    /// started again.
    pub async fn shutdown(&self) {
        self.tasks.lock().await.clear();
        self.connection.teardown().await;
    }

    /// Shuts down and forgets the credentials.
    pub async fn logout(&self) {
        self.shutdown().await;
        self.credentials().clear().await;
        info!(user_id = %self.user_id, "auth: logged out");
    }

    /// Routes connection signals into the timelines and reacts to session
    /// events. Holds the signal receiver for as long as it runs.
    fn spawn_dispatcher(self: &Arc<Self>) -> Subscription {
        let session: Weak<Self> = Arc::downgrade(self);
        let signals = self.signals.clone();
        let mut events = self.events.subscribe();
        Subscription::new(tokio::spawn(async move {
            let mut signals = signals.lock_owned().await;
            loop {
                tokio::select! {
                    signal = signals.recv() => {
                        let Some(signal) = signal else { return };
                        let Some(session) = session.upgrade() else { return };
                        session.handle_signal(signal).await;
                    }
                    event = events.recv() => {
                        let Some(session) = session.upgrade() else { return };
                        match event {
                            Ok(ClientEvent::CredentialsRefreshed) => {
                                if let Err(err) = session.connection.reauthenticate().await {
                                    warn!("realtime: reauthenticate failed: {err}");
                                }
                            }
                            Ok(ClientEvent::SessionExpired { .. }) => {
                                session.connection.teardown().await;
                            }
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        }))
    }

    async fn handle_signal(&self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Inbound(InboundEvent::ChatMessage(message)) => {
                let channel_id = match message.channel_id.clone() {
                    Some(channel_id) => Some(channel_id),
                    None => self.connection.active_channel().await,
                };
                let Some(channel_id) = channel_id else {
                    debug!("realtime: chat message without a channel dropped");
                    return;
                };
                let inbound = InboundMessage::from_chat(message, Utc::now());
                self.apply_inbound(ConversationKey::Channel(channel_id), inbound)
                    .await;
            }
            ConnectionSignal::Inbound(
                InboundEvent::ReceiveDm(message) | InboundEvent::DmSentConfirmation(message),
            ) => {
                let key = direct_conversation(&self.user_id, &message);
                self.apply_inbound(key, InboundMessage::from_direct(message))
                    .await;
            }
            ConnectionSignal::Inbound(InboundEvent::DmError(error)) => {
                warn!("realtime: direct message rejected: {error}");
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("direct message failed: {error}")));
            }
            ConnectionSignal::Resynced { channel_id } => {
                if let Err(err) = self.resync_channel(&channel_id).await {
                    warn!(channel_id = %channel_id, "realtime: history refetch failed: {err}");
                    let _ = self.events.send(ClientEvent::Error(format!(
                        "failed to reload channel {channel_id}: {err}"
                    )));
                }
            }
        }
    }

    async fn apply_inbound(&self, conversation: ConversationKey, message: InboundMessage) {
        let outcome = self
            .reconciler
            .lock()
            .await
            .apply(conversation.clone(), message, Utc::now());
        if outcome.changed_timeline() {
            let _ = self.events.send(ClientEvent::TimelineUpdated { conversation });
        } else {
            debug!("realtime: duplicate event dropped");
        }
    }

    async fn resync_channel(&self, channel_id: &ChannelId) -> ClientResult<()> {
        let history = self
            .backend
            .fetch_channel_history(channel_id, self.settings.history_limit)
            .await?;
        let now = Utc::now();
        let key = ConversationKey::Channel(channel_id.clone());
        let changed = self.reconciler.lock().await.apply_history(
            &key,
            history
                .into_iter()
                .map(|message| InboundMessage::from_chat(message, now)),
            now,
        );
        debug!(channel_id = %channel_id, changed, "realtime: history merged");
        if changed > 0 {
            let _ = self
                .events
                .send(ClientEvent::TimelineUpdated { conversation: key });
        }
        Ok(())
    }
}

fn build_http(settings: &ClientSettings) -> ClientResult<Client> {
    Client::builder()
        .timeout(settings.request_timeout())
        .build()
        .map_err(|err| ClientError::Config(format!("failed to build http client: {err}")))
}

fn build_guard(
    settings: &ClientSettings,
    http: Client,
    credentials: Arc<CredentialStore>,
    events: broadcast::Sender<ClientEvent>,
) -> Arc<RequestGuard> {
    let refresh = Arc::new(RefreshCoordinator::new(
        http.clone(),
        &settings.api_base_url,
        credentials,
        events,
        settings.refresh_timeout(),
    ));
    Arc::new(RequestGuard::new(http, settings.api_base_url.clone(), refresh))
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
