//! Local persisted key/value storage.
//!
//! The file store keeps a flat JSON map in `<base>/storage.json` with
//! restricted permissions (0600). Values are never logged.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::config::paths;

/// Storage keys written by the auth layer.
pub mod keys {
    /// Persisted session JSON owned by the auth client.
    pub const SESSION: &str = "kinship.auth.token";
    /// Liveness marker: present while a session is believed to exist.
    pub const HAS_SESSION: &str = "has_session";
    pub const AUTH_USER_ID: &str = "auth_user_id";
    /// RFC 3339 expiry hint of the current session.
    pub const SESSION_EXPIRES_AT: &str = "session_expires_at";
    /// RFC 3339 time of the last successful refresh.
    pub const LAST_SESSION_REFRESH: &str = "last_session_refresh";

    /// Every key the auth layer knows it writes.
    pub const KNOWN: &[&str] = &[
        SESSION,
        HAS_SESSION,
        AUTH_USER_ID,
        SESSION_EXPIRES_AT,
        LAST_SESSION_REFRESH,
    ];

    /// Substrings that mark an arbitrary key as auth-related.
    pub const AUTH_MARKERS: &[&str] = &["auth", "session", "user", "token", "sb-"];

    pub fn is_auth_related(key: &str) -> bool {
        let lower = key.to_ascii_lowercase();
        KNOWN.contains(&key) || AUTH_MARKERS.iter().any(|m| lower.contains(m))
    }
}

/// Browser-local-storage style key/value store.
pub trait CredentialStore: Send + Sync {
    /// # Errors
    /// Returns an error if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes a key; returns whether it was present.
    ///
    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn remove(&self, key: &str) -> Result<bool>;

    /// # Errors
    /// Returns an error if the backing storage cannot be read.
    fn keys(&self) -> Result<Vec<String>>;
}

/// JSON-file backed store.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at the default location under ${KINSHIP_HOME}.
    pub fn open_default() -> Self {
        Self::new(paths::storage_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read storage from {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse storage from {}", self.path.display()))
    }

    fn save(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(map).context("Failed to serialize storage")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, contents)
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        Ok(())
    }

    fn with_map<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> (T, bool)) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        let mut map = self.load()?;
        let (out, dirty) = f(&mut map);
        if dirty {
            self.save(&map)?;
        }
        Ok(out)
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_map(|map| (map.get(key).cloned(), false))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_map(|map| {
            map.insert(key.to_string(), value.to_string());
            ((), true)
        })
    }

    fn remove(&self, key: &str) -> Result<bool> {
        self.with_map(|map| {
            let had = map.remove(key).is_some();
            (had, had)
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.with_map(|map| (map.keys().cloned().collect(), false))
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries()?.keys().cloned().collect())
    }
}
