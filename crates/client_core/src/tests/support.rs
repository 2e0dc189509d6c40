//! Scripted realtime transport and in-memory backend shared by the
//! connection, delivery and session tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, MessageId},
    protocol::{AckPayload, ChatMessage, DirectThread, OutboundEvent, PersistMessageRequest},
};
use tokio::{sync::broadcast, time::Instant};

use crate::{
    backend::ChatBackend,
    error::{ClientError, ClientResult},
    transport::{ConnectAuth, RealtimeConnector, RealtimeTransport, TransportEvent},
};

/// What the next `emit_with_ack` does.
#[derive(Debug, Clone)]
pub(crate) enum AckBehavior {
    Ack(AckPayload),
    Reject(String),
    /// Never answers, so the caller's ack timeout fires.
    Hang,
}

impl AckBehavior {
    pub(crate) fn ack_with_id(id: &str) -> Self {
        AckBehavior::Ack(AckPayload {
            error: None,
            message_id: Some(MessageId::new(id)),
            timestamp: None,
        })
    }
}

#[derive(Default)]
pub(crate) struct ScriptState {
    pub acks: VecDeque<AckBehavior>,
    pub emitted: Vec<(Instant, OutboundEvent)>,
}

pub(crate) struct ScriptedTransport {
    pub auth: ConnectAuth,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    script: Arc<Mutex<ScriptState>>,
    pub closes: AtomicUsize,
}

impl ScriptedTransport {
    /// Simulates the server dropping the socket.
    pub(crate) fn drop_connection(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected(reason.into()));
        }
    }

    /// Marks the socket dead without telling anyone, like a half-open TCP
    /// connection.
    pub(crate) fn go_silent(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub(crate) fn push(&self, event: shared::protocol::InboundEvent) {
        let _ = self.events.send(TransportEvent::Inbound(event));
    }

    fn record(&self, event: OutboundEvent) {
        self.script
            .lock()
            .expect("script lock")
            .emitted
            .push((Instant::now(), event));
    }
}

#[async_trait]
impl RealtimeTransport for ScriptedTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: OutboundEvent) -> ClientResult<()> {
        if !self.is_connected() {
            return Err(ClientError::TransportDisconnected("scripted socket closed".into()));
        }
        self.record(event);
        Ok(())
    }

    async fn emit_with_ack(&self, event: OutboundEvent) -> ClientResult<AckPayload> {
        if !self.is_connected() {
            return Err(ClientError::TransportDisconnected("scripted socket closed".into()));
        }
        self.record(event);
        let behavior = self
            .script
            .lock()
            .expect("script lock")
            .acks
            .pop_front()
            .unwrap_or(AckBehavior::Ack(AckPayload::default()));
        match behavior {
            AckBehavior::Ack(payload) => Ok(payload),
            AckBehavior::Reject(error) => Ok(AckPayload {
                error: Some(error),
                ..AckPayload::default()
            }),
            AckBehavior::Hang => std::future::pending().await,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Hands out a fresh `ScriptedTransport` per connect. All transports share
/// one ack script and emit log so tests can follow a message across
/// reconnects.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    pub script: Arc<Mutex<ScriptState>>,
    pub transports: Mutex<Vec<Arc<ScriptedTransport>>>,
    pub refuse: AtomicBool,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script_acks(&self, acks: impl IntoIterator<Item = AckBehavior>) {
        self.script.lock().expect("script lock").acks.extend(acks);
    }

    pub(crate) fn connects(&self) -> usize {
        self.transports.lock().expect("transports lock").len()
    }

    pub(crate) fn latest(&self) -> Arc<ScriptedTransport> {
        self.transports
            .lock()
            .expect("transports lock")
            .last()
            .cloned()
            .expect("at least one connect")
    }

    pub(crate) fn emitted(&self) -> Vec<(Instant, OutboundEvent)> {
        self.script.lock().expect("script lock").emitted.clone()
    }

    pub(crate) fn emitted_named(&self, name: &str) -> Vec<(Instant, OutboundEvent)> {
        self.emitted()
            .into_iter()
            .filter(|(_, event)| event.name() == name)
            .collect()
    }
}

#[async_trait]
impl RealtimeConnector for ScriptedConnector {
    async fn connect(&self, auth: &ConnectAuth) -> ClientResult<Arc<dyn RealtimeTransport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::TransportDisconnected("connection refused".into()));
        }
        let (events, _) = broadcast::channel(64);
        let transport = Arc::new(ScriptedTransport {
            auth: auth.clone(),
            connected: AtomicBool::new(true),
            events,
            script: self.script.clone(),
            closes: AtomicUsize::new(0),
        });
        self.transports
            .lock()
            .expect("transports lock")
            .push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
pub(crate) struct StubBackend {
    pub history: Mutex<HashMap<ChannelId, Vec<ChatMessage>>>,
    pub threads: Mutex<Vec<DirectThread>>,
    pub persisted: Mutex<Vec<PersistMessageRequest>>,
    pub history_calls: AtomicUsize,
}

impl StubBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_history(&self, channel_id: &ChannelId, messages: Vec<ChatMessage>) {
        self.history
            .lock()
            .expect("history lock")
            .insert(channel_id.clone(), messages);
    }

    pub(crate) fn persisted(&self) -> Vec<PersistMessageRequest> {
        self.persisted.lock().expect("persisted lock").clone()
    }
}

#[async_trait]
impl ChatBackend for StubBackend {
    async fn fetch_channel_history(
        &self,
        channel_id: &ChannelId,
        _limit: u32,
    ) -> ClientResult<Vec<ChatMessage>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .history
            .lock()
            .expect("history lock")
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_direct_threads(&self) -> ClientResult<Vec<DirectThread>> {
        Ok(self.threads.lock().expect("threads lock").clone())
    }

    async fn persist_message(&self, request: &PersistMessageRequest) -> ClientResult<()> {
        self.persisted
            .lock()
            .expect("persisted lock")
            .push(request.clone());
        Ok(())
    }
}
