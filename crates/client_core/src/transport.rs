use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{AckPayload, ClientFrame, OutboundEvent, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    Subscription,
};

const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// Identity presented when the socket is opened.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectAuth {
    pub user_id: UserId,
    pub access_token: String,
}

impl std::fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAuth")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Inbound(shared::protocol::InboundEvent),
    /// The socket is gone. Sent at most once per transport.
    Disconnected(String),
}

/// One open realtime socket.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Fire-and-forget emit.
    async fn emit(&self, event: OutboundEvent) -> ClientResult<()>;

    /// Emits and waits for the matching acknowledgment. Does not time out on
    /// its own; callers bound the wait.
    async fn emit_with_ack(&self, event: OutboundEvent) -> ClientResult<AckPayload>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self);
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, auth: &ConnectAuth) -> ClientResult<Arc<dyn RealtimeTransport>>;
}

pub struct MissingRealtimeConnector;

#[async_trait]
impl RealtimeConnector for MissingRealtimeConnector {
    async fn connect(&self, _auth: &ConnectAuth) -> ClientResult<Arc<dyn RealtimeTransport>> {
        Err(ClientError::Config(
            "realtime connector is not configured".into(),
        ))
    }
}

/// Opens websocket transports against `url`. The user id travels as a query
/// parameter and the access token as a bearer header.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    async fn connect(&self, auth: &ConnectAuth) -> ClientResult<Arc<dyn RealtimeTransport>> {
        let mut url = Url::parse(&self.url)
            .map_err(|err| ClientError::Config(format!("invalid realtime url {}: {err}", self.url)))?;
        url.query_pairs_mut()
            .append_pair("userId", auth.user_id.as_str());

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ClientError::Config(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", auth.access_token))
            .map_err(|err| ClientError::Config(format!("invalid access token header: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request).await.map_err(|err| {
            ClientError::TransportDisconnected(format!("failed to connect websocket: {err}"))
        })?;
        debug!(user_id = %auth.user_id, "realtime: websocket opened");
        Ok(WsTransport::spawn(stream))
    }
}

type PendingAcks = Arc<StdMutex<HashMap<u64, oneshot::Sender<AckPayload>>>>;

/// Websocket transport. A writer task drains an mpsc queue into the sink; a
/// reader task routes acks to their waiters and broadcasts pushed events.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Message>,
    pending_acks: PendingAcks,
    next_ack_id: AtomicU64,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    reader: StdMutex<Option<Subscription>>,
    _writer: Subscription,
}

/// Removes an ack waiter when the emitting future is dropped early.
struct PendingAck {
    id: u64,
    pending: PendingAcks,
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl WsTransport {
    pub fn spawn(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Arc<Self> {
        let (mut sink, mut reader) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);
        let pending_acks: PendingAcks = Arc::new(StdMutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // a failed write ends the writer; the reader reports the disconnect
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    warn!("realtime: websocket write failed: {err}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let pump = {
            let connected = connected.clone();
            let pending_acks = pending_acks.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let reason = loop {
                    match reader.next().await {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => match frame.into_event() {
                                Ok(event) => {
                                    let _ = events.send(TransportEvent::Inbound(event));
                                }
                                Err(ack) => {
                                    let waiter = pending_acks
                                        .lock()
                                        .unwrap_or_else(PoisonError::into_inner)
                                        .remove(&ack.ack_id);
                                    match waiter {
                                        Some(waiter) => {
                                            let _ = waiter.send(ack.payload);
                                        }
                                        None => debug!(ack_id = ack.ack_id, "realtime: ack without waiter"),
                                    }
                                }
                            },
                            Err(err) => warn!("realtime: failed to parse server frame: {err}"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|frame| format!("closed by server: {}", frame.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break format!("websocket error: {err}"),
                        None => break "websocket stream ended".to_string(),
                    }
                };
                if connected.swap(false, Ordering::SeqCst) {
                    pending_acks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clear();
                    let _ = events.send(TransportEvent::Disconnected(reason));
                }
            })
        };

        Arc::new(Self {
            outbound,
            pending_acks,
            next_ack_id: AtomicU64::new(1),
            connected,
            events,
            reader: StdMutex::new(Some(Subscription::new(pump))),
            _writer: Subscription::new(writer),
        })
    }

    fn send_frame(&self, frame: &ClientFrame) -> ClientResult<()> {
        if !self.is_connected() {
            return Err(ClientError::TransportDisconnected("socket is closed".into()));
        }
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::TransportDisconnected("socket writer stopped".into()))
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: OutboundEvent) -> ClientResult<()> {
        self.send_frame(&ClientFrame {
            ack_id: None,
            message: event,
        })
    }

    async fn emit_with_ack(&self, event: OutboundEvent) -> ClientResult<AckPayload> {
        let id = self.next_ack_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _pending = PendingAck {
            id,
            pending: self.pending_acks.clone(),
        };

        self.send_frame(&ClientFrame {
            ack_id: Some(id),
            message: event,
        })?;
        rx.await.map_err(|_| {
            ClientError::TransportDisconnected("socket closed before acknowledgment".into())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let _ = self.outbound.send(Message::Close(None));
        // the writer exits on its own after flushing the close frame
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
