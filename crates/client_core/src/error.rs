use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the session and realtime layers.
///
/// The type is `Clone` because a single refresh outcome is handed to every
/// caller that queued behind it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("access token expired and no session is available")]
    AuthExpired,
    #[error("no refresh token stored")]
    NoRefreshToken,
    #[error("session refresh failed: {0}")]
    RefreshFailed(String),
    #[error("realtime transport disconnected: {0}")]
    TransportDisconnected(String),
    #[error("no acknowledgment within {timeout_ms}ms")]
    DeliveryTimeout { timeout_ms: u64 },
    #[error("server rejected message: {0}")]
    DeliveryRejected(String),
    #[error("failed to deliver message after {attempts} attempts")]
    DeliveryExhausted { attempts: u32 },
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response payload: {0}")]
    Decode(String),
    #[error("credential storage error: {0}")]
    Storage(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    Validation(String),
}

impl ClientError {
    pub fn api(status: StatusCode, message: impl Into<String>) -> Self {
        ClientError::Api {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// Errors after which the user has to log in again.
    pub fn is_terminal_auth(&self) -> bool {
        matches!(
            self,
            ClientError::AuthExpired | ClientError::NoRefreshToken | ClientError::RefreshFailed(_)
        )
    }

    /// Errors that are worth another delivery attempt.
    pub fn is_retryable_delivery(&self) -> bool {
        matches!(
            self,
            ClientError::TransportDisconnected(_)
                | ClientError::DeliveryTimeout { .. }
                | ClientError::DeliveryRejected(_)
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            ClientError::Decode(value.to_string())
        } else {
            ClientError::Http(value.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::Decode(value.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        ClientError::Storage(value.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
