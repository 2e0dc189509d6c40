use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, ConversationKey, DeliveryState, LocalId, UserId},
    protocol::{
        AckPayload, OutboundChatMessage, OutboundDirectMessage, OutboundEvent,
        PersistMessageRequest,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::ChatBackend,
    config::ClientSettings,
    connection::ChannelConnection,
    error::{ClientError, ClientResult},
    reconcile::InboundReconciler,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub ack_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for RetryPolicy {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            max_attempts: settings.max_delivery_attempts.max(1),
            base_delay: settings.retry_base_delay(),
            ack_timeout: settings.ack_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt number `attempt` (1-based). Grows linearly.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// One locally composed message on its way to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    pub local_id: LocalId,
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

impl OutboundEnvelope {
    pub fn new(conversation: ConversationKey, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            local_id: LocalId::generate(),
            conversation,
            sender_id,
            content: content.into(),
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.conversation, ConversationKey::Direct(_))
    }

    fn to_event(&self) -> OutboundEvent {
        match &self.conversation {
            ConversationKey::Channel(channel_id) => {
                OutboundEvent::ChatMessage(OutboundChatMessage {
                    channel_id: channel_id.clone(),
                    sender_id: self.sender_id.clone(),
                    content: self.content.clone(),
                    client_id: self.local_id,
                })
            }
            ConversationKey::Direct(receiver_id) => OutboundEvent::SendDm(OutboundDirectMessage {
                sender_id: self.sender_id.clone(),
                receiver_id: receiver_id.clone(),
                message: self.content.clone(),
                client_id: self.local_id,
            }),
        }
    }

    fn persist_request(&self) -> PersistMessageRequest {
        let channel_id = match &self.conversation {
            ConversationKey::Channel(channel_id) => channel_id.clone(),
            ConversationKey::Direct(receiver_id) => ChannelId::new(receiver_id.as_str()),
        };
        PersistMessageRequest {
            message: self.content.clone(),
            channel_id,
            is_dm: self.is_direct(),
        }
    }
}

enum DeliveryFailure {
    /// The connection was torn down mid-flight.
    Abandoned,
    Exhausted { attempts: u32, last_error: String },
}

/// Sends envelopes over the realtime connection and drives each one to a
/// terminal state: acknowledged once, or failed after the retry budget.
pub struct DeliveryEngine {
    connection: Arc<ChannelConnection>,
    reconciler: Arc<Mutex<InboundReconciler>>,
    backend: Arc<dyn ChatBackend>,
    events: broadcast::Sender<ClientEvent>,
    policy: RetryPolicy,
}

impl DeliveryEngine {
    pub fn new(
        connection: Arc<ChannelConnection>,
        reconciler: Arc<Mutex<InboundReconciler>>,
        backend: Arc<dyn ChatBackend>,
        events: broadcast::Sender<ClientEvent>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            connection,
            reconciler,
            backend,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn send(&self, channel_id: ChannelId, content: &str) -> ClientResult<OutboundEnvelope> {
        self.submit(ConversationKey::Channel(channel_id), content).await
    }

    pub async fn send_direct(&self, receiver_id: UserId, content: &str) -> ClientResult<OutboundEnvelope> {
        self.submit(ConversationKey::Direct(receiver_id), content).await
    }

    /// Shows the message optimistically, then delivers it. Returns the
    /// envelope in its terminal state.
    async fn submit(&self, conversation: ConversationKey, content: &str) -> ClientResult<OutboundEnvelope> {
        if content.trim().is_empty() {
            return Err(ClientError::Validation("message is empty".into()));
        }
        let mut envelope = OutboundEnvelope::new(
            conversation,
            self.connection.user_id().clone(),
            content,
        );
        let epoch = self.connection.session_epoch();

        self.reconciler.lock().await.insert_optimistic(
            envelope.conversation.clone(),
            envelope.local_id,
            envelope.sender_id.clone(),
            envelope.content.clone(),
            envelope.created_at,
        );
        self.notify_timeline(&envelope.conversation);

        match self.deliver(&envelope, epoch).await {
            Ok(ack) => {
                if self.connection.session_epoch() != epoch {
                    return Err(torn_down());
                }
                self.reconciler.lock().await.mark_acknowledged(
                    &envelope.conversation,
                    envelope.local_id,
                    ack.message_id,
                    ack.timestamp,
                );
                envelope.delivery_state = DeliveryState::Acknowledged;
                let _ = self.events.send(ClientEvent::DeliveryAcknowledged {
                    local_id: envelope.local_id,
                });
                self.notify_timeline(&envelope.conversation);
                self.persist(&envelope).await;
                Ok(envelope)
            }
            Err(DeliveryFailure::Abandoned) => {
                // the server may still hold the message; leave it pending for
                // the next history load to confirm or for the UI to drop
                info!(local_id = %envelope.local_id, "delivery: abandoned by teardown");
                let _ = self.events.send(ClientEvent::DeliveryAbandoned {
                    conversation: envelope.conversation.clone(),
                    local_id: envelope.local_id,
                });
                Err(torn_down())
            }
            Err(DeliveryFailure::Exhausted {
                attempts,
                last_error,
            }) => {
                warn!(
                    local_id = %envelope.local_id,
                    attempts,
                    "delivery: giving up: {last_error}"
                );
                self.reconciler
                    .lock()
                    .await
                    .mark_failed(&envelope.conversation, envelope.local_id);
                envelope.delivery_state = DeliveryState::Failed;
                let _ = self.events.send(ClientEvent::DeliveryFailed {
                    local_id: envelope.local_id,
                    reason: last_error,
                });
                self.notify_timeline(&envelope.conversation);
                Err(ClientError::DeliveryExhausted { attempts })
            }
        }
    }

    async fn deliver(&self, envelope: &OutboundEnvelope, epoch: u64) -> Result<AckPayload, DeliveryFailure> {
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            if self.connection.session_epoch() != epoch {
                return Err(DeliveryFailure::Abandoned);
            }
            if self.confirmed_by_echo(envelope).await {
                debug!(local_id = %envelope.local_id, "delivery: confirmed by echo");
                return Ok(AckPayload::default());
            }
            match self.attempt(envelope).await {
                Ok(ack) => {
                    info!(local_id = %envelope.local_id, attempt, "delivery: acknowledged");
                    return Ok(ack);
                }
                Err(err) => {
                    warn!(
                        local_id = %envelope.local_id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        "delivery: attempt failed: {err}"
                    );
                    last_error = err.to_string();
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }
        if self.confirmed_by_echo(envelope).await {
            return Ok(AckPayload::default());
        }
        Err(DeliveryFailure::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// One send. Resolves early with an empty ack if the echo confirms the
    /// message while the ack is still outstanding.
    async fn attempt(&self, envelope: &OutboundEnvelope) -> ClientResult<AckPayload> {
        let transport = self.connection.transport().await?;
        let acked = tokio::time::timeout(
            self.policy.ack_timeout,
            transport.emit_with_ack(envelope.to_event()),
        );
        let ack = tokio::select! {
            acked = acked => acked.map_err(|_| ClientError::DeliveryTimeout {
                timeout_ms: u64::try_from(self.policy.ack_timeout.as_millis()).unwrap_or(u64::MAX),
            })??,
            _ = self.echo_confirmation(envelope) => {
                debug!(local_id = %envelope.local_id, "delivery: echo arrived before ack");
                return Ok(AckPayload::default());
            }
        };
        if let Some(error) = ack.error {
            return Err(ClientError::DeliveryRejected(error));
        }
        Ok(ack)
    }

    async fn echo_confirmation(&self, envelope: &OutboundEnvelope) {
        let confirmations = self.reconciler.lock().await.confirmations();
        loop {
            let notified = confirmations.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.confirmed_by_echo(envelope).await {
                return;
            }
            notified.await;
        }
    }

    async fn confirmed_by_echo(&self, envelope: &OutboundEnvelope) -> bool {
        self.reconciler
            .lock()
            .await
            .delivery_state(&envelope.conversation, envelope.local_id)
            == Some(DeliveryState::Acknowledged)
    }

    /// Durable write after the ack. A failure is surfaced but does not undo
    /// the acknowledgment.
    async fn persist(&self, envelope: &OutboundEnvelope) {
        if let Err(err) = self.backend.persist_message(&envelope.persist_request()).await {
            warn!(local_id = %envelope.local_id, "delivery: durable write failed: {err}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("failed to save message: {err}")));
        }
    }

    fn notify_timeline(&self, conversation: &ConversationKey) {
        let _ = self.events.send(ClientEvent::TimelineUpdated {
            conversation: conversation.clone(),
        });
    }
}

fn torn_down() -> ClientError {
    ClientError::TransportDisconnected("connection torn down before delivery finished".into())
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
