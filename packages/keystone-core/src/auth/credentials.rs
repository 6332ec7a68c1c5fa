//! Secure credential storage with platform keyring and file-based backends.
//!
//! Backend selection (compile time):
//! 1. Platform keyring (if `keyring-storage` is enabled and `file-storage` is not)
//! 2. File-based storage under the keystone config directory
//!
//! Entries are addressed by a fixed service name and a fixed logical key.
//! Writing a key overwrites it; there is no merge. Concurrent processes are
//! not coordinated, the last writer wins.

use crate::auth::error::StoreError;
use crate::auth::token::TokenPair;
use crate::cloud::config::keystone_config_dir;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[cfg(feature = "keyring-storage")]
use keyring::Entry;

/// Service name every entry is stored under
pub const SERVICE_NAME: &str = "keystone";
/// Key holding the access token (JWT)
pub const ACCESS_TOKEN_KEY: &str = "keystone_token";
/// Key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "keystone_refresh_token";
/// Key holding the server-side session identifier
pub const SESSION_KEY: &str = "keystone_session";

/// Opaque secret storage addressed by `(service, key)`.
pub trait SecretStore: Send + Sync {
    fn get(&self, service: &str, key: &str) -> Result<String, StoreError>;
    fn set(&self, service: &str, key: &str, secret: &str) -> Result<(), StoreError>;

    /// Write several keys as one unit.
    ///
    /// The default writes in order. If a write fails, the keys already
    /// written get their previous secret back and the first error is
    /// returned. A key that had no previous secret is left as written.
    fn set_all(&self, service: &str, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let previous = entries
            .iter()
            .map(|(key, _)| match self.get(service, key) {
                Ok(secret) => Ok(Some(secret)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (written, (key, secret)) in entries.iter().enumerate() {
            if let Err(e) = self.set(service, key, secret) {
                tracing::warn!("Failed to store '{}', restoring earlier entries: {}", key, e);
                for ((key, _), old) in entries[..written].iter().zip(&previous) {
                    if let Some(old) = old {
                        if let Err(restore) = self.set(service, key, old) {
                            tracing::error!("Failed to restore '{}': {}", key, restore);
                        }
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

fn not_found(service: &str, key: &str) -> StoreError {
    StoreError::KeyNotFound {
        service: service.to_string(),
        key: key.to_string(),
    }
}

// ============================================================================
// Keyring-based storage (optional, platform-specific)
// ============================================================================

/// Platform keychain: macOS Keychain, Windows Credential Manager or the
/// Linux Secret Service.
#[cfg(feature = "keyring-storage")]
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

#[cfg(feature = "keyring-storage")]
impl KeyringStore {
    fn entry(service: &str, key: &str) -> Result<Entry, StoreError> {
        tracing::trace!("Creating keyring entry for service='{}', key='{}'", service, key);
        Entry::new(service, key).map_err(|e| {
            tracing::error!(
                "Failed to create keyring entry (service='{}', key='{}'): {}",
                service,
                key,
                e
            );
            StoreError::KeychainUnavailable(e.to_string())
        })
    }
}

#[cfg(feature = "keyring-storage")]
impl SecretStore for KeyringStore {
    fn get(&self, service: &str, key: &str) -> Result<String, StoreError> {
        match Self::entry(service, key)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => Err(not_found(service, key)),
            Err(e) => Err(StoreError::KeychainUnavailable(e.to_string())),
        }
    }

    fn set(&self, service: &str, key: &str, secret: &str) -> Result<(), StoreError> {
        Self::entry(service, key)?
            .set_password(secret)
            .map_err(|e| StoreError::KeychainUnavailable(e.to_string()))?;
        tracing::debug!("Stored '{}' in keyring", key);
        Ok(())
    }
}

// ============================================================================
// File-based storage (always available)
// ============================================================================

/// JSON file of `service/key -> secret`, readable by the owner only.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File store at `<config_dir>/keystone/.credentials`.
    pub fn default_location() -> Result<Self, StoreError> {
        let dir = keystone_config_dir()
            .map_err(|e| StoreError::KeychainUnavailable(e.to_string()))?;
        Ok(Self::new(dir.join(".credentials")))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn entry_name(service: &str, key: &str) -> String {
        format!("{}/{}", service, key)
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            StoreError::KeychainUnavailable(format!("failed to read {:?}: {}", self.path, e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            StoreError::KeychainUnavailable(format!("failed to parse {:?}: {}", self.path, e))
        })
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let unavailable = |what: &str, e: &dyn std::fmt::Display| {
            StoreError::KeychainUnavailable(format!("{} {:?}: {}", what, self.path, e))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| unavailable("failed to create dir for", &e))?;
            }
        }
        let json = serde_json::to_string(entries).map_err(|e| unavailable("failed to encode", &e))?;

        // Set restrictive permissions on Unix before writing
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600) // Owner read/write only
                .open(&self.path)
                .map_err(|e| unavailable("failed to open", &e))?;
            let mut file = std::io::BufWriter::new(file);
            file.write_all(json.as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| unavailable("failed to write", &e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, &json).map_err(|e| unavailable("failed to write", &e))?;
        }

        tracing::debug!("Credentials saved to file: {:?}", self.path);
        Ok(())
    }
}

impl SecretStore for FileStore {
    fn get(&self, service: &str, key: &str) -> Result<String, StoreError> {
        self.read_entries()?
            .remove(&Self::entry_name(service, key))
            .ok_or_else(|| not_found(service, key))
    }

    fn set(&self, service: &str, key: &str, secret: &str) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        entries.insert(Self::entry_name(service, key), secret.to_string());
        self.write_entries(&entries)
    }

    fn set_all(&self, service: &str, new_entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        for (key, secret) in new_entries {
            entries.insert(Self::entry_name(service, key), secret.to_string());
        }
        self.write_entries(&entries)
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Process-local store for tests and embedders that must not touch the keychain.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, service: &str, key: &str) -> Result<String, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::KeychainUnavailable("memory store poisoned".into()))?;
        entries
            .get(&(service.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| not_found(service, key))
    }

    fn set(&self, service: &str, key: &str, secret: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::KeychainUnavailable("memory store poisoned".into()))?;
        entries.insert((service.to_string(), key.to_string()), secret.to_string());
        Ok(())
    }

    fn set_all(&self, service: &str, new_entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::KeychainUnavailable("memory store poisoned".into()))?;
        for (key, secret) in new_entries {
            entries.insert((service.to_string(), key.to_string()), secret.to_string());
        }
        Ok(())
    }
}

/// Memory store whose writes to one key always fail.
#[cfg(test)]
pub(crate) struct FailingStore {
    pub(crate) inner: MemoryStore,
    pub(crate) failing_key: &'static str,
}

#[cfg(test)]
impl SecretStore for FailingStore {
    fn get(&self, service: &str, key: &str) -> Result<String, StoreError> {
        self.inner.get(service, key)
    }

    fn set(&self, service: &str, key: &str, secret: &str) -> Result<(), StoreError> {
        if key == self.failing_key {
            return Err(StoreError::KeychainUnavailable("write rejected".into()));
        }
        self.inner.set(service, key, secret)
    }
}

// ============================================================================
// Public API
// ============================================================================

/// The store selected by crate features.
pub fn default_store() -> Result<Arc<dyn SecretStore>, StoreError> {
    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage")))]
    {
        Ok(Arc::new(KeyringStore))
    }

    #[cfg(not(all(feature = "keyring-storage", not(feature = "file-storage"))))]
    {
        Ok(Arc::new(FileStore::default_location()?))
    }
}

/// Get information about credential storage location (for display)
pub fn storage_description() -> String {
    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage"), target_os = "windows"))]
    {
        "Windows Credential Manager".to_string()
    }
    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage"), target_os = "macos"))]
    {
        "macOS Keychain".to_string()
    }
    #[cfg(all(
        feature = "keyring-storage",
        not(feature = "file-storage"),
        not(any(target_os = "windows", target_os = "macos"))
    ))]
    {
        "Secret Service (GNOME Keyring/KWallet)".to_string()
    }
    #[cfg(not(all(feature = "keyring-storage", not(feature = "file-storage"))))]
    {
        let path = FileStore::default_location()
            .map(|s| s.path().display().to_string())
            .unwrap_or_else(|_| "~/.config/keystone/.credentials".to_string());
        format!("File-based storage: {}", path)
    }
}

/// Read the stored access/refresh pair.
///
/// `KeyNotFound` is returned untouched so callers can fall through to
/// another strategy.
pub fn load_token_pair(store: &dyn SecretStore) -> Result<TokenPair, StoreError> {
    let access = store.get(SERVICE_NAME, ACCESS_TOKEN_KEY)?;
    let refresh = store.get(SERVICE_NAME, REFRESH_TOKEN_KEY)?;
    Ok(TokenPair::bearer(access, refresh))
}

/// Persist both halves of a token pair; a failed write leaves the old pair.
pub fn store_token_pair(store: &dyn SecretStore, pair: &TokenPair) -> Result<(), StoreError> {
    store.set_all(
        SERVICE_NAME,
        &[
            (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
            (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
        ],
    )?;
    tracing::debug!("Token pair stored");
    Ok(())
}

/// Read the stored session identifier; absence is `Ok(None)`.
pub fn load_session(store: &dyn SecretStore) -> Result<Option<String>, StoreError> {
    match store.get(SERVICE_NAME, SESSION_KEY) {
        Ok(session) if session.is_empty() => Ok(None),
        Ok(session) => Ok(Some(session)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn store_session(store: &dyn SecretStore, session: &str) -> Result<(), StoreError> {
    store.set(SERVICE_NAME, SESSION_KEY, session)?;
    tracing::debug!("Session stored");
    Ok(())
}
