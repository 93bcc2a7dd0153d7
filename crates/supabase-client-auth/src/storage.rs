//! Local persistence of the auth session and PKCE code verifier.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LocalStorageError;
use crate::types::Session;

/// Default key the session is persisted under.
pub const STORAGE_KEY: &str = "supabase.auth.token";

/// Raw key-value backend for auth persistence.
///
/// Implementations are called from the session manager's serialized
/// context, so they never see concurrent writes for the same key from one
/// client.
pub trait AuthLocalStorage: Send + Sync {
    /// Store a value, replacing any previous one.
    fn store(&self, key: &str, value: &[u8]) -> Result<(), LocalStorageError>;

    /// Retrieve a value.
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, LocalStorageError>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), LocalStorageError>;
}

// ── In-memory ─────────────────────────────────────────────────

/// Process-local storage. Sessions do not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthLocalStorage for InMemoryStorage {
    fn store(&self, key: &str, value: &[u8]) -> Result<(), LocalStorageError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, LocalStorageError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStorageError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

// ── File ──────────────────────────────────────────────────────

/// One file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Use `dir` for storage, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LocalStorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

impl AuthLocalStorage for FileStorage {
    fn store(&self, key: &str, value: &[u8]) -> Result<(), LocalStorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "Stored auth value");
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, LocalStorageError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<(), LocalStorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Typed session storage ─────────────────────────────────────

/// A session plus the instant it expires, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session: Session,
    pub expiration_date: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(session: Session) -> Self {
        let expiration_date = session
            .expiry()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);
        Self {
            session,
            expiration_date,
        }
    }
}

/// Typed view over an [`AuthLocalStorage`] for the session and the PKCE
/// code verifier.
#[derive(Clone)]
pub struct SessionStorage {
    backend: Arc<dyn AuthLocalStorage>,
    key: String,
}

impl SessionStorage {
    pub fn new(backend: Arc<dyn AuthLocalStorage>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the persisted session, if any.
    pub fn get(&self) -> Result<Option<StoredSession>, LocalStorageError> {
        let Some(bytes) = self.backend.retrieve(&self.key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| LocalStorageError::Corrupt(e.to_string()))
    }

    pub fn set(&self, stored: &StoredSession) -> Result<(), LocalStorageError> {
        let bytes =
            serde_json::to_vec(stored).map_err(|e| LocalStorageError::Corrupt(e.to_string()))?;
        self.backend.store(&self.key, &bytes)
    }

    pub fn clear(&self) -> Result<(), LocalStorageError> {
        self.backend.remove(&self.key)
    }

    fn code_verifier_key(&self) -> String {
        format!("{}-code-verifier", self.key)
    }

    pub fn code_verifier(&self) -> Result<Option<String>, LocalStorageError> {
        let bytes = self.backend.retrieve(&self.code_verifier_key())?;
        match bytes {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| LocalStorageError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn set_code_verifier(&self, verifier: &str) -> Result<(), LocalStorageError> {
        self.backend
            .store(&self.code_verifier_key(), verifier.as_bytes())
    }

    /// Best-effort removal; a leftover verifier is harmless.
    pub fn clear_code_verifier(&self) {
        if let Err(e) = self.backend.remove(&self.code_verifier_key()) {
            warn!(error = %e, "Failed to remove PKCE code verifier");
        }
    }
}

impl std::fmt::Debug for SessionStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStorage")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
