use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use shared::protocol::RefreshResponse;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::error::{ClientError, ClientResult};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CredentialPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    pub fn from_refresh(response: RefreshResponse, now: DateTime<Utc>) -> Self {
        let expires_at = i64::try_from(response.expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at,
        }
    }

    pub fn expires_within(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        self.expires_at <= now + skew
    }
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Durable home of the credential pair between process runs.
pub trait TokenStorage: Send + Sync {
    fn load(&self) -> ClientResult<Option<CredentialPair>>;
    fn save(&self, pair: &CredentialPair) -> ClientResult<()>;
    fn clear(&self) -> ClientResult<()>;
}

#[derive(Default)]
pub struct MemoryTokenStorage {
    slot: StdMutex<Option<CredentialPair>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            slot: StdMutex::new(Some(pair)),
        }
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn load(&self) -> ClientResult<Option<CredentialPair>> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, pair: &CredentialPair) -> ClientResult<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// On-disk layout: the same three keys the web client keeps in local
/// storage, with the expiry as epoch milliseconds.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCredentials {
    access_token: String,
    refresh_token: String,
    token_expiry: i64,
}

pub struct FileTokenStorage {
    path: PathBuf,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStorage for FileTokenStorage {
    fn load(&self) -> ClientResult<Option<CredentialPair>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let persisted: PersistedCredentials = serde_json::from_str(&raw)
            .map_err(|err| ClientError::Storage(format!("corrupt credential file: {err}")))?;
        let expires_at = Utc
            .timestamp_millis_opt(persisted.token_expiry)
            .single()
            .ok_or_else(|| ClientError::Storage("invalid token expiry".into()))?;
        Ok(Some(CredentialPair {
            access_token: persisted.access_token,
            refresh_token: persisted.refresh_token,
            expires_at,
        }))
    }

    fn save(&self, pair: &CredentialPair) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_vec_pretty(&PersistedCredentials {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
            token_expiry: pair.expires_at.timestamp_millis(),
        })?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Process-wide holder of the credential pair. Every change bumps a
/// generation counter so the realtime connection can notice rotated tokens.
pub struct CredentialStore {
    current: RwLock<Option<CredentialPair>>,
    storage: Arc<dyn TokenStorage>,
    generation: watch::Sender<u64>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn TokenStorage>) -> Self {
        Self::with_initial(storage, None)
    }

    fn with_initial(storage: Arc<dyn TokenStorage>, initial: Option<CredentialPair>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: RwLock::new(initial),
            storage,
            generation,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTokenStorage::new()))
    }

    /// Builds a store and restores whatever pair the storage holds.
    pub fn load(storage: Arc<dyn TokenStorage>) -> ClientResult<Self> {
        let restored = storage.load()?;
        if restored.is_some() {
            info!("auth: restored persisted credentials");
        }
        Ok(Self::with_initial(storage, restored))
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|pair| pair.refresh_token.clone())
    }

    pub async fn snapshot(&self) -> Option<CredentialPair> {
        self.current.read().await.clone()
    }

    pub async fn has_session(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Installs a new pair. A storage failure is logged; the in-memory pair
    /// stays authoritative for the rest of the process.
    pub async fn replace(&self, pair: CredentialPair) {
        if let Err(err) = self.storage.save(&pair) {
            warn!("auth: failed to persist credentials: {err}");
        }
        *self.current.write().await = Some(pair);
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Drops both tokens. Returns whether a session was present, so callers
    /// can signal the end of the session exactly once.
    pub async fn clear(&self) -> bool {
        let previous = self.current.write().await.take();
        if let Err(err) = self.storage.clear() {
            warn!("auth: failed to clear persisted credentials: {err}");
        }
        if previous.is_some() {
            self.generation.send_modify(|generation| *generation += 1);
        }
        previous.is_some()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
