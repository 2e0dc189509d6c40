use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::ChannelId,
    protocol::{ChatMessage, DirectThread, DirectThreadsResponse, PersistMessageRequest},
};

use crate::{
    error::{ClientError, ClientResult},
    guard::{GuardedRequest, RequestGuard},
};

/// REST surface the realtime layer depends on: history for catch-up and the
/// durable write that follows an acknowledged send.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_channel_history(
        &self,
        channel_id: &ChannelId,
        limit: u32,
    ) -> ClientResult<Vec<ChatMessage>>;

    async fn fetch_direct_threads(&self) -> ClientResult<Vec<DirectThread>>;

    async fn persist_message(&self, request: &PersistMessageRequest) -> ClientResult<()>;
}

pub struct MissingChatBackend;

#[async_trait]
impl ChatBackend for MissingChatBackend {
    async fn fetch_channel_history(
        &self,
        _channel_id: &ChannelId,
        _limit: u32,
    ) -> ClientResult<Vec<ChatMessage>> {
        Err(ClientError::Config("chat backend is not configured".into()))
    }

    async fn fetch_direct_threads(&self) -> ClientResult<Vec<DirectThread>> {
        Err(ClientError::Config("chat backend is not configured".into()))
    }

    async fn persist_message(&self, _request: &PersistMessageRequest) -> ClientResult<()> {
        Err(ClientError::Config("chat backend is not configured".into()))
    }
}

/// `ChatBackend` over the REST API, with every call going through the
/// request guard.
pub struct RestChatBackend {
    guard: Arc<RequestGuard>,
}

impl RestChatBackend {
    pub fn new(guard: Arc<RequestGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl ChatBackend for RestChatBackend {
    async fn fetch_channel_history(
        &self,
        channel_id: &ChannelId,
        limit: u32,
    ) -> ClientResult<Vec<ChatMessage>> {
        let request = GuardedRequest::get(format!("/api/channels/{channel_id}/messages"))
            .query("limit", limit);
        let mut messages: Vec<ChatMessage> = self.guard.send_json(request).await?;
        for message in &mut messages {
            message.channel_id.get_or_insert_with(|| channel_id.clone());
        }
        Ok(messages)
    }

    async fn fetch_direct_threads(&self) -> ClientResult<Vec<DirectThread>> {
        let response: DirectThreadsResponse =
            self.guard.send_json(GuardedRequest::get("/api/dms")).await?;
        Ok(response.threads)
    }

    async fn persist_message(&self, request: &PersistMessageRequest) -> ClientResult<()> {
        self.guard
            .send_empty(GuardedRequest::post("/api/messages").json(request)?)
            .await
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
