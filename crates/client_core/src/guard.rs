use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{error::ApiErrorBody, protocol::REFRESH_PATH};
use tracing::debug;

use crate::{
    credentials::CredentialStore,
    error::{ClientError, ClientResult},
    refresh::RefreshCoordinator,
    SessionRedirect,
};

/// An outbound REST call that can be replayed once after a credential refresh.
#[derive(Debug, Clone)]
pub struct GuardedRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    bearer: Option<String>,
    retried: bool,
}

impl GuardedRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> ClientResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Sends this exact token instead of the stored one.
    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub fn is_refresh_call(&self) -> bool {
        self.path.contains(REFRESH_PATH)
    }
}

/// Attaches the bearer token to outgoing requests and recovers from a single
/// 401 by refreshing and replaying.
pub struct RequestGuard {
    http: Client,
    base_url: String,
    refresh: Arc<RefreshCoordinator>,
}

impl RequestGuard {
    pub fn new(http: Client, base_url: impl Into<String>, refresh: Arc<RefreshCoordinator>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            refresh,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        self.refresh.credentials()
    }

    pub fn refresh(&self) -> &Arc<RefreshCoordinator> {
        &self.refresh
    }

    /// Runs `request`. Non-401 responses are returned untouched, whatever
    /// their status. A 401 is replayed at most once.
    pub async fn execute(&self, mut request: GuardedRequest) -> ClientResult<Response> {
        loop {
            let token_used = match &request.bearer {
                Some(token) => Some(token.clone()),
                None => self.credentials().access_token().await,
            };
            let response = self.dispatch(&request, token_used.as_deref()).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            if request.retried || request.is_refresh_call() {
                self.refresh
                    .terminate_session(
                        SessionRedirect::Home,
                        &format!("{} rejected after refresh", request.path),
                    )
                    .await;
                return Err(ClientError::RefreshFailed(format!(
                    "{} still unauthorized after refresh",
                    request.path
                )));
            }

            let fresh = self.recover_token(token_used.as_deref()).await?;
            debug!(path = %request.path, "auth: replaying request with refreshed token");
            request.retried = true;
            request.bearer = Some(fresh);
        }
    }

    /// Executes and decodes a JSON body, turning error statuses into
    /// `ClientError::Api`.
    pub async fn send_json<T: DeserializeOwned>(&self, request: GuardedRequest) -> ClientResult<T> {
        let response = ensure_success(self.execute(request).await?).await?;
        Ok(response.json().await?)
    }

    pub async fn send_empty(&self, request: GuardedRequest) -> ClientResult<()> {
        ensure_success(self.execute(request).await?).await?;
        Ok(())
    }

    /// Picks the token for the replay. A 401 for a token that has since been
    /// rotated is replayed with the current one instead of refreshing again.
    async fn recover_token(&self, token_used: Option<&str>) -> ClientResult<String> {
        let Some(current) = self.credentials().access_token().await else {
            return Err(ClientError::AuthExpired);
        };
        if token_used != Some(current.as_str()) && !self.refresh.is_refreshing() {
            return Ok(current);
        }
        self.refresh.refresh().await
    }

    async fn dispatch(&self, request: &GuardedRequest, token: Option<&str>) -> ClientResult<Response> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.send().await?)
    }
}

pub(crate) async fn ensure_success(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(ClientError::api(
        status,
        ApiErrorBody::from_text(&text).describe(),
    ))
}

#[cfg(test)]
#[path = "tests/guard_tests.rs"]
mod tests;
