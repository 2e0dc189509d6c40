use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, LocalId, MessageId, UserId};

pub const REFRESH_PATH: &str = "/api/auth/refresh";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the new access token, in seconds.
    pub expires_in: u64,
}

/// Durable copy of a message, written over REST once the realtime channel
/// has acknowledged it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistMessageRequest {
    pub message: String,
    #[serde(rename = "channelId")]
    pub channel_id: ChannelId,
    #[serde(rename = "isDM")]
    pub is_dm: bool,
}

/// A channel message as delivered by the realtime `chat_message` event and by
/// the history endpoint. History rows use snake_case keys, the socket uses
/// camelCase; both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, alias = "id", alias = "message_id", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, alias = "channel_id", skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(alias = "sender_id")]
    pub sender_id: UserId,
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "client_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<LocalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, alias = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<LocalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadUser {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectThread {
    #[serde(default)]
    pub other_user: Option<ThreadUser>,
    #[serde(default)]
    pub messages: Vec<DirectMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectThreadsResponse {
    #[serde(default)]
    pub threads: Vec<DirectThread>,
}

/// Auth payload presented when the realtime socket is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChatMessage {
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub client_id: LocalId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundDirectMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
    pub client_id: LocalId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    JoinRoom(ChannelId),
    ChatMessage(OutboundChatMessage),
    SendDm(OutboundDirectMessage),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRoom(_) => "join_room",
            OutboundEvent::ChatMessage(_) => "chat_message",
            OutboundEvent::SendDm(_) => "send_dm",
        }
    }
}

/// Frame written to the socket. `ack_id` is present when the sender waits for
/// an acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    pub message: OutboundEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub ack_id: u64,
    #[serde(flatten)]
    pub payload: AckPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundEvent {
    ChatMessage(ChatMessage),
    ReceiveDm(DirectMessage),
    DmSentConfirmation(DirectMessage),
    DmError(String),
}

/// Frame read from the socket: either an acknowledgment for an earlier
/// `ClientFrame` or a pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack(AckFrame),
    ChatMessage(ChatMessage),
    ReceiveDm(DirectMessage),
    DmSentConfirmation(DirectMessage),
    DmError(String),
}

impl ServerFrame {
    pub fn into_event(self) -> Result<InboundEvent, AckFrame> {
        match self {
            ServerFrame::Ack(ack) => Err(ack),
            ServerFrame::ChatMessage(message) => Ok(InboundEvent::ChatMessage(message)),
            ServerFrame::ReceiveDm(message) => Ok(InboundEvent::ReceiveDm(message)),
            ServerFrame::DmSentConfirmation(message) => {
                Ok(InboundEvent::DmSentConfirmation(message))
            }
            ServerFrame::DmError(error) => Ok(InboundEvent::DmError(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_rows_accept_snake_case_and_numeric_ids() {
        let raw = r#"{"id": 42, "sender_id": "u-1", "message": "hi", "timestamp": "2024-05-01T10:00:00Z"}"#;
        let message: ChatMessage = serde_json::from_str(raw).expect("decode");
        assert_eq!(message.message_id, Some(MessageId::new("42")));
        assert_eq!(message.sender_id, UserId::new("u-1"));
        assert_eq!(message.content, "hi");
        assert!(message.client_id.is_none());
    }

    #[test]
    fn outbound_chat_message_uses_socket_field_names() {
        let frame = ClientFrame {
            ack_id: Some(3),
            message: OutboundEvent::ChatMessage(OutboundChatMessage {
                channel_id: ChannelId::new("c-1"),
                sender_id: UserId::new("u-1"),
                content: "hello".into(),
                client_id: LocalId::generate(),
            }),
        };
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(value["ackId"], 3);
        assert_eq!(value["message"]["type"], "chat_message");
        assert_eq!(value["message"]["payload"]["channelId"], "c-1");
        assert_eq!(value["message"]["payload"]["senderId"], "u-1");
    }

    #[test]
    fn ack_frame_with_error_decodes() {
        let raw = r#"{"type": "ack", "payload": {"ackId": 9, "error": "rate limited"}}"#;
        let frame: ServerFrame = serde_json::from_str(raw).expect("decode");
        let ack = frame.into_event().expect_err("ack frame");
        assert_eq!(ack.ack_id, 9);
        assert_eq!(ack.payload.error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn persist_request_uses_rest_field_names() {
        let body = PersistMessageRequest {
            message: "hello".into(),
            channel_id: ChannelId::new("c-9"),
            is_dm: false,
        };
        let value = serde_json::to_value(&body).expect("encode");
        assert_eq!(value["channelId"], "c-9");
        assert_eq!(value["isDM"], false);
    }
}
