use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    time::Duration,
};

use chrono::Utc;
use reqwest::Client;
use shared::{
    error::ApiErrorBody,
    protocol::{RefreshRequest, RefreshResponse, REFRESH_PATH},
};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use crate::{
    credentials::{CredentialPair, CredentialStore},
    error::{ClientError, ClientResult},
    ClientEvent, SessionRedirect, Subscription,
};

const PROACTIVE_REFRESH_MIN_SLEEP: Duration = Duration::from_secs(1);

type RefreshOutcome = ClientResult<String>;

/// Leader flag plus the callers parked behind the leader.
#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// Exchanges the stored refresh token for a new credential pair, at most once
/// at a time no matter how many callers ask.
pub struct RefreshCoordinator {
    http: Client,
    refresh_url: String,
    credentials: Arc<CredentialStore>,
    events: broadcast::Sender<ClientEvent>,
    timeout: Duration,
    state: StdMutex<RefreshState>,
}

enum Role {
    Leader,
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

/// Held by the leader while it refreshes. If the leader is dropped before it
/// settles, the parked waiters are rejected instead of hanging forever.
struct LeaderSlot<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl LeaderSlot<'_> {
    fn settle(mut self, outcome: &RefreshOutcome) {
        self.coordinator.release(outcome);
        self.settled = true;
    }
}

impl Drop for LeaderSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.release(&Err(ClientError::RefreshFailed(
                "refresh cancelled before completion".into(),
            )));
        }
    }
}

impl RefreshCoordinator {
    pub fn new(
        http: Client,
        api_base_url: &str,
        credentials: Arc<CredentialStore>,
        events: broadcast::Sender<ClientEvent>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            refresh_url: format!("{}{REFRESH_PATH}", api_base_url.trim_end_matches('/')),
            credentials,
            events,
            timeout,
            state: StdMutex::new(RefreshState::default()),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_state().refreshing
    }

    /// Returns a fresh access token. Concurrent callers share one network
    /// exchange and all observe its outcome.
    pub async fn refresh(&self) -> RefreshOutcome {
        let role = {
            let mut state = self.lock_state();
            if state.refreshing {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Role::Waiter(rx)
            } else {
                state.refreshing = true;
                Role::Leader
            }
        };

        match role {
            Role::Waiter(rx) => rx.await.unwrap_or_else(|_| {
                Err(ClientError::RefreshFailed(
                    "refresh leader went away".into(),
                ))
            }),
            Role::Leader => {
                let slot = LeaderSlot {
                    coordinator: self,
                    settled: false,
                };
                let outcome = self.lead().await;
                slot.settle(&outcome);
                outcome
            }
        }
    }

    /// Proactive entry point: refreshes only when the access token expires
    /// within `skew`. Returns the new token when a refresh happened.
    pub async fn refresh_if_expiring(&self, skew: Duration) -> ClientResult<Option<String>> {
        let pair = self
            .credentials
            .snapshot()
            .await
            .ok_or(ClientError::AuthExpired)?;
        if !pair.expires_within(Utc::now(), skew) {
            return Ok(None);
        }
        self.refresh().await.map(Some)
    }

    /// Keeps the session warm by refreshing `skew` before expiry. Stops when
    /// the session ends or a refresh fails.
    pub fn spawn_proactive_refresh(self: &Arc<Self>, skew: Duration) -> Subscription {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        Subscription::new(tokio::spawn(async move {
            loop {
                let Some(this) = coordinator.upgrade() else {
                    return;
                };
                let Some(pair) = this.credentials.snapshot().await else {
                    return;
                };
                let until_refresh = (pair.expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .saturating_sub(skew)
                    .max(PROACTIVE_REFRESH_MIN_SLEEP);
                drop(this);

                tokio::time::sleep(until_refresh).await;

                let Some(this) = coordinator.upgrade() else {
                    return;
                };
                if let Err(err) = this.refresh_if_expiring(skew).await {
                    warn!("auth: proactive refresh stopped: {err}");
                    return;
                }
            }
        }))
    }

    /// Ends the session: clears both tokens and, if a session was actually
    /// present, tells subscribers to send the user back to login.
    pub async fn terminate_session(&self, redirect: SessionRedirect, reason: &str) {
        if self.credentials.clear().await {
            warn!(?redirect, "auth: session terminated: {reason}");
            let _ = self.events.send(ClientEvent::SessionExpired { redirect });
        }
    }

    async fn lead(&self) -> RefreshOutcome {
        let outcome = match tokio::time::timeout(self.timeout, self.exchange()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::RefreshFailed(format!(
                "refresh timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(access_token) => {
                info!("auth: access token refreshed");
                let _ = self.events.send(ClientEvent::CredentialsRefreshed);
                Ok(access_token)
            }
            Err(err) => {
                let err = match err {
                    ClientError::NoRefreshToken | ClientError::RefreshFailed(_) => err,
                    other => ClientError::RefreshFailed(other.to_string()),
                };
                self.terminate_session(SessionRedirect::Login, &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    async fn exchange(&self) -> RefreshOutcome {
        let refresh_token = self
            .credentials
            .refresh_token()
            .await
            .ok_or(ClientError::NoRefreshToken)?;

        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::RefreshFailed(format!(
                "refresh endpoint returned {status}: {}",
                ApiErrorBody::from_text(&text).describe()
            )));
        }

        let body: RefreshResponse = response.json().await?;
        if !self.credentials.has_session().await {
            return Err(ClientError::RefreshFailed(
                "session ended while refreshing".into(),
            ));
        }
        let pair = CredentialPair::from_refresh(body, Utc::now());
        let access_token = pair.access_token.clone();
        self.credentials.replace(pair).await;
        Ok(access_token)
    }

    /// Hands `outcome` to every parked waiter, then clears the leader flag.
    /// Both happen under one lock so no caller can park in between.
    fn release(&self, outcome: &RefreshOutcome) {
        let mut state = self.lock_state();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        state.refreshing = false;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
