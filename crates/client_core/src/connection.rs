use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use serde::Serialize;
use shared::{
    domain::{ChannelId, UserId},
    protocol::{InboundEvent, OutboundEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    credentials::CredentialStore,
    error::{ClientError, ClientResult},
    transport::{ConnectAuth, RealtimeConnector, RealtimeTransport, TransportEvent},
    ClientEvent, Subscription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// What the connection hands to its owner besides state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
    Inbound(InboundEvent),
    /// A fresh socket replaced a lost or stale one and rejoined `channel_id`.
    /// Anything sent while it was down has to be fetched again.
    Resynced { channel_id: ChannelId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub watchdog_interval: Duration,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ConnectionSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            watchdog_interval: settings.watchdog_interval(),
            connect_timeout: settings.connect_timeout(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
        }
    }
}

#[derive(Default)]
struct ConnectionInner {
    started: bool,
    transport: Option<Arc<dyn RealtimeTransport>>,
    /// Access token the current transport was opened with.
    authenticated_with: Option<String>,
    active_channel: Option<ChannelId>,
    pump: Option<Subscription>,
    watchdog: Option<Subscription>,
    failed_reconnects: u32,
}

impl ConnectionInner {
    fn live_transport(&self) -> Option<&Arc<dyn RealtimeTransport>> {
        self.transport
            .as_ref()
            .filter(|transport| transport.is_connected())
    }
}

/// Keeps one realtime socket alive for the logged-in user: opens it, rejoins
/// the active channel, and reopens it when it drops or its token rotates.
pub struct ChannelConnection {
    connector: Arc<dyn RealtimeConnector>,
    credentials: Arc<CredentialStore>,
    user_id: UserId,
    settings: ConnectionSettings,
    inner: Mutex<ConnectionInner>,
    state: watch::Sender<ConnectionState>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
    events: broadcast::Sender<ClientEvent>,
    epoch: AtomicU64,
}

impl ChannelConnection {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        credentials: Arc<CredentialStore>,
        user_id: UserId,
        settings: ConnectionSettings,
        events: broadcast::Sender<ClientEvent>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionSignal>) {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let connection = Arc::new(Self {
            connector,
            credentials,
            user_id,
            settings,
            inner: Mutex::new(ConnectionInner::default()),
            state,
            signals,
            events,
            epoch: AtomicU64::new(0),
        });
        (connection, signals_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Bumped on every teardown. Work started under an older epoch must not
    /// touch state that belongs to the current one.
    pub fn session_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.inner.lock().await.active_channel.clone()
    }

    /// Opens the socket and starts the watchdog. A failed first attempt is
    /// returned, and the watchdog keeps retrying in the background.
    pub async fn connect(self: &Arc<Self>) -> ClientResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.live_transport().is_some() {
            return Ok(());
        }
        inner.started = true;
        if inner.watchdog.is_none() {
            inner.watchdog = Some(self.spawn_watchdog());
        }

        self.set_state(ConnectionState::Connecting);
        inner.pump.take();
        if let Some(stale) = inner.transport.take() {
            stale.close().await;
        }
        match self.open(&mut inner).await {
            Ok(()) => {
                inner.failed_reconnects = 0;
                info!(user_id = %self.user_id, "realtime: connected");
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                warn!("realtime: connect failed: {err}");
                inner.failed_reconnects = 1;
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Makes `channel_id` the active room. Joined immediately when the socket
    /// is up, and again after every reconnect.
    pub async fn join_channel(&self, channel_id: ChannelId) -> ClientResult<()> {
        let mut inner = self.inner.lock().await;
        inner.active_channel = Some(channel_id.clone());
        if let Some(transport) = inner.live_transport() {
            transport.emit(OutboundEvent::JoinRoom(channel_id.clone())).await?;
            debug!(channel_id = %channel_id, "realtime: joined channel");
        }
        Ok(())
    }

    pub async fn transport(&self) -> ClientResult<Arc<dyn RealtimeTransport>> {
        self.inner
            .lock()
            .await
            .live_transport()
            .cloned()
            .ok_or_else(|| ClientError::TransportDisconnected("realtime socket is not open".into()))
    }

    /// Reopens the socket with the current access token, if it was opened
    /// with an older one.
    pub async fn reauthenticate(self: &Arc<Self>) -> ClientResult<()> {
        if !self.inner.lock().await.started {
            return Ok(());
        }
        self.reconnect("credentials rotated").await.map(|_| ())
    }

    /// Stops the watchdog, closes the socket and returns to `Idle`. Safe to
    /// call more than once.
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.started && inner.transport.is_none() {
            return;
        }
        inner.started = false;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        inner.watchdog.take();
        inner.pump.take();
        if let Some(transport) = inner.transport.take() {
            transport.close().await;
        }
        inner.authenticated_with = None;
        inner.active_channel = None;
        inner.failed_reconnects = 0;
        self.set_state(ConnectionState::Idle);
        info!(user_id = %self.user_id, "realtime: connection torn down");
    }

    async fn open(self: &Arc<Self>, inner: &mut ConnectionInner) -> ClientResult<()> {
        let access_token = self
            .credentials
            .access_token()
            .await
            .ok_or(ClientError::AuthExpired)?;
        let auth = ConnectAuth {
            user_id: self.user_id.clone(),
            access_token: access_token.clone(),
        };
        let transport = tokio::time::timeout(self.settings.connect_timeout, self.connector.connect(&auth))
            .await
            .map_err(|_| {
                ClientError::TransportDisconnected(format!(
                    "connect timed out after {}ms",
                    self.settings.connect_timeout.as_millis()
                ))
            })??;

        // subscribe before joining so nothing the join triggers is missed
        inner.pump = Some(self.spawn_pump(transport.clone()));
        inner.transport = Some(transport.clone());
        inner.authenticated_with = Some(access_token);

        if let Some(channel_id) = inner.active_channel.clone() {
            if let Err(err) = transport.emit(OutboundEvent::JoinRoom(channel_id.clone())).await {
                warn!(channel_id = %channel_id, "realtime: rejoin failed: {err}");
            }
        }
        Ok(())
    }

    /// Replaces the socket unless a live one already uses the current token.
    /// Returns whether a new socket was opened.
    async fn reconnect(self: &Arc<Self>, reason: &str) -> ClientResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.started {
            return Ok(false);
        }
        let current_token = self.credentials.access_token().await;
        if inner.live_transport().is_some() && inner.authenticated_with == current_token {
            return Ok(false);
        }

        info!(reason, attempt = inner.failed_reconnects + 1, "realtime: reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        inner.pump.take();
        if let Some(stale) = inner.transport.take() {
            stale.close().await;
        }
        inner.authenticated_with = None;

        match self.open(&mut inner).await {
            Ok(()) => {
                inner.failed_reconnects = 0;
                self.set_state(ConnectionState::Connected);
                info!(user_id = %self.user_id, "realtime: reconnected");
                if let Some(channel_id) = inner.active_channel.clone() {
                    let _ = self.signals.send(ConnectionSignal::Resynced { channel_id });
                }
                Ok(true)
            }
            Err(err) => {
                inner.failed_reconnects += 1;
                warn!(
                    attempts = inner.failed_reconnects,
                    max_attempts = self.settings.max_reconnect_attempts,
                    "realtime: reconnect failed: {err}"
                );
                let session_gone = matches!(err, ClientError::AuthExpired);
                if session_gone || inner.failed_reconnects >= self.settings.max_reconnect_attempts {
                    self.give_up(&mut inner);
                } else {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    /// Stops reconnecting after too many failures. The connection goes back
    /// to `Idle` and the caller has to `connect` again.
    fn give_up(&self, inner: &mut ConnectionInner) {
        inner.started = false;
        // the watchdog may be the caller; it exits on its next check
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.detach();
        }
        self.set_state(ConnectionState::Idle);
        let _ = self.events.send(ClientEvent::Error(format!(
            "realtime connection lost after {} reconnect attempts",
            inner.failed_reconnects
        )));
    }

    fn spawn_pump(self: &Arc<Self>, transport: Arc<dyn RealtimeTransport>) -> Subscription {
        let mut events = transport.subscribe();
        let connection = Arc::downgrade(self);
        let signals = self.signals.clone();
        Subscription::new(tokio::spawn(async move {
            loop {
                let reason = match events.recv().await {
                    Ok(TransportEvent::Inbound(event)) => {
                        if signals.send(ConnectionSignal::Inbound(event)).is_err() {
                            return;
                        }
                        continue;
                    }
                    Ok(TransportEvent::Disconnected(reason)) => reason,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime: inbound events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => "transport closed".to_string(),
                };
                if let Some(connection) = connection.upgrade() {
                    connection.mark_dropped(&transport, &reason).await;
                }
                return;
            }
        }))
    }

    async fn mark_dropped(&self, transport: &Arc<dyn RealtimeTransport>, reason: &str) {
        let inner = self.inner.lock().await;
        let is_current = inner
            .transport
            .as_ref()
            .is_some_and(|current| same_transport(current, transport));
        if is_current && inner.started {
            warn!("realtime: connection dropped: {reason}");
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn spawn_watchdog(self: &Arc<Self>) -> Subscription {
        let connection: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.watchdog_interval;
        Subscription::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                if !connection.watchdog_tick().await {
                    return;
                }
            }
        }))
    }

    /// One health check. Returns false once the connection has stopped.
    async fn watchdog_tick(self: &Arc<Self>) -> bool {
        let reason = {
            let inner = self.inner.lock().await;
            if !inner.started {
                return false;
            }
            if inner.live_transport().is_none() {
                "socket is down"
            } else if inner.authenticated_with != self.credentials.access_token().await {
                "access token rotated"
            } else {
                return true;
            }
        };
        let _ = self.reconnect(reason).await;
        self.inner.lock().await.started
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(state = ?next, "realtime: state changed");
            let _ = self.events.send(ClientEvent::ConnectionStateChanged(next));
        }
    }
}

fn same_transport(a: &Arc<dyn RealtimeTransport>, b: &Arc<dyn RealtimeTransport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
