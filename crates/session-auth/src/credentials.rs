//! Credential storage for the signed-in session
//!
//! A session is one access/refresh token pair plus its absolute expiry. The
//! store API only exchanges whole pairs: there is no way to update one token
//! without the other, so no reader can ever observe a new access token paired
//! with an old refresh token.
//!
//! `FileCredentialStore` persists the pair as JSON using atomic temp-file +
//! rename writes. `MemoryCredentialStore` keeps it in process memory.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The session's OAuth credentials.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta).
/// Computed at storage time from `TokenResponse.expires_in` plus the current time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    /// Bearer token attached to API calls
    #[serde(rename = "access")]
    pub access_token: Secret<String>,
    /// Token used to obtain the next pair
    #[serde(rename = "refresh")]
    pub refresh_token: Secret<String>,
    /// Expiration as unix timestamp in milliseconds
    #[serde(rename = "expires")]
    pub expires_at: u64,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>, expires_at: u64) -> Self {
        Self {
            access_token: Secret::new(access.into()),
            refresh_token: Secret::new(refresh.into()),
            expires_at,
        }
    }

    /// Build a pair from a token endpoint response received at `now_millis`.
    pub fn from_token_response(response: TokenResponse, now_millis: u64) -> Self {
        Self {
            access_token: Secret::new(response.access_token),
            refresh_token: Secret::new(response.refresh_token),
            expires_at: now_millis.saturating_add(response.expires_in.saturating_mul(1000)),
        }
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at <= now_millis
    }

    /// Whether the access token expires within `window` of `now_millis`.
    pub fn expires_within(&self, now_millis: u64, window: Duration) -> bool {
        self.expires_at <= now_millis.saturating_add(window.as_millis() as u64)
    }
}

/// Durable storage for the session's credential pair.
///
/// `set` replaces both tokens in one step. Uses `Pin<Box<dyn Future>>` return
/// types for dyn-compatibility (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Snapshot of the stored pair, if any.
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<CredentialPair>> + Send + '_>>;

    /// Atomically replace the stored pair.
    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Remove all stored credentials. Deleting an empty store is not an error.
    fn delete(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Process-memory credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            state: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<CredentialPair>> + Send + '_>> {
        Box::pin(async move { self.state.read().await.clone() })
    }

    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.write().await = Some(pair);
            Ok(())
        })
    }

    fn delete(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.write().await = None;
            Ok(())
        })
    }
}

/// On-disk layout of the credential file. An empty file is `{}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<CredentialPair>,
}

/// JSON-file credential store.
///
/// The Mutex serializes writes and guards the in-memory copy. A write reaches
/// disk before the in-memory copy changes, so a failed write leaves the old
/// pair in place on both sides.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<Option<CredentialPair>>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (signed-out cold start).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let file: CredentialFile = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(
                path = %path.display(),
                signed_in = file.session.is_some(),
                "loaded credentials"
            );
            file.session
        } else {
            info!(path = %path.display(), "credential file not found, starting signed out");
            write_atomic(&path, &CredentialFile::default()).await?;
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<CredentialPair>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let file = CredentialFile {
                session: Some(pair),
            };
            write_atomic(&self.path, &file).await?;
            *state = file.session;
            debug!("replaced credential pair");
            Ok(())
        })
    }

    fn delete(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            write_atomic(&self.path, &CredentialFile::default()).await?;
            if state.take().is_some() {
                debug!("deleted credential pair");
            }
            Ok(())
        })
    }
}

/// Write the credential file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains OAuth tokens.
async fn write_atomic(path: &Path, data: &CredentialFile) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
