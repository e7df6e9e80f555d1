//! Device-local identity: stable uid, display name and sharing preference.
//!
//! Persisted under two keys:
//! - `livemap_identity`: JSON blob `{uid, name, sharing_mode}`
//! - `livemap_uid`     : legacy standalone uid string
//!
//! Both are read once at startup and written on every local mutation.
//! Storage failures never surface to the caller: the store falls back to an
//! in-memory identity for the rest of the session.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::is_query_safe;

/// Key holding the JSON identity blob.
pub const IDENTITY_KEY: &str = "livemap_identity";
/// Key holding the legacy standalone uid.
pub const LEGACY_UID_KEY: &str = "livemap_uid";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
}

/// What the local user shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// Exact location
    #[default]
    Full,
    /// No location
    Off,
    /// Location shifted by a per-session random offset
    Fuzzy,
}

impl SharingMode {
    /// Whether the location poll should run in this mode.
    pub fn is_sharing(self) -> bool {
        !matches!(self, SharingMode::Off)
    }
}

impl fmt::Display for SharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SharingMode::Full => "full",
            SharingMode::Off => "off",
            SharingMode::Fuzzy => "fuzzy",
        })
    }
}

impl FromStr for SharingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SharingMode::Full),
            "off" => Ok(SharingMode::Off),
            "fuzzy" => Ok(SharingMode::Fuzzy),
            other => Err(format!("unknown sharing mode {other:?} (expected full, off or fuzzy)")),
        }
    }
}

/// The local user's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sharing_mode: SharingMode,
}

impl Identity {
    /// Fresh identity with a random uid, empty name, full sharing.
    pub fn generate() -> Self {
        Self::with_uid(Uuid::new_v4().to_string())
    }

    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: String::new(),
            sharing_mode: SharingMode::Full,
        }
    }
}

/// Durable string key-value storage port.
pub trait KeyValueStore: Send {
    /// Read a value; `Ok(None)` if the key was never written.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Write a value, replacing any previous one.
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-memory store (tests, and callers that opt out of persistence).
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValueStore {
    entries: HashMap<String, String>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per key under a base directory.
pub struct FsKeyValueStore {
    base: PathBuf,
}

impl FsKeyValueStore {
    /// Create a store rooted at `base`, creating the directory if needed.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Create a store under the platform data directory
    /// (e.g. `~/.local/share/livemap`).
    pub fn at_default_location() -> Result<Self, StoreError> {
        let dirs = ProjectDirs::from("org", "livemap", "livemap")
            .ok_or_else(|| StoreError::Unavailable("could not resolve data dir".into()))?;
        Self::new(dirs.data_dir())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base.join(key))
    }
}

impl KeyValueStore for FsKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        // Write-then-rename so a crash never leaves a half-written blob.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Owns the local identity and keeps it persisted.
pub struct IdentityStore {
    identity: Identity,
    /// `None` once storage has failed; the identity is session-only from then on.
    store: Option<Box<dyn KeyValueStore>>,
}

impl IdentityStore {
    /// Load the persisted identity, or create and persist a new one.
    ///
    /// A legacy standalone uid is adopted when no identity blob exists.
    /// Never fails: unreadable storage yields a session-only identity.
    pub fn load(store: Box<dyn KeyValueStore>) -> Self {
        match read_identity(store.as_ref()) {
            Ok(Some(identity)) if is_query_safe(&identity.uid) => {
                log::debug!("Loaded identity {}", identity.uid);
                Self {
                    identity,
                    store: Some(store),
                }
            }
            Ok(Some(stale)) => {
                log::warn!("Stored uid {:?} is not usable, generating a new one", stale.uid);
                let mut this = Self {
                    identity: Identity {
                        uid: Identity::generate().uid,
                        ..stale
                    },
                    store: Some(store),
                };
                this.persist();
                this
            }
            Ok(None) => {
                let identity = match store.get(LEGACY_UID_KEY) {
                    Ok(Some(uid)) if is_query_safe(uid.trim()) => {
                        log::info!("Upgrading legacy uid {}", uid.trim());
                        Identity::with_uid(uid.trim())
                    }
                    _ => Identity::generate(),
                };
                let mut this = Self {
                    identity,
                    store: Some(store),
                };
                this.persist();
                this
            }
            Err(e) => {
                log::warn!("Identity storage unavailable, using session-only identity: {e}");
                Self::in_memory(Identity::generate())
            }
        }
    }

    /// Session-only identity store (nothing is persisted).
    pub fn in_memory(identity: Identity) -> Self {
        Self {
            identity,
            store: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn uid(&self) -> &str {
        &self.identity.uid
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn sharing_mode(&self) -> SharingMode {
        self.identity.sharing_mode
    }

    /// Whether mutations still reach durable storage.
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Change the display name. Returns `true` if it changed.
    ///
    /// Persisted before returning. Broadcasting the change is the
    /// connection's job (see `ClientHandle::set_name`).
    pub fn set_name(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.identity.name == name {
            return false;
        }
        self.identity.name = name;
        self.persist();
        true
    }

    /// Change the sharing mode. Returns `true` if it changed.
    pub fn set_sharing_mode(&mut self, mode: SharingMode) -> bool {
        if self.identity.sharing_mode == mode {
            return false;
        }
        self.identity.sharing_mode = mode;
        self.persist();
        true
    }

    fn persist(&mut self) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let result = serde_json::to_string(&self.identity)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
            .and_then(|blob| store.put(IDENTITY_KEY, &blob))
            .and_then(|()| store.put(LEGACY_UID_KEY, &self.identity.uid));
        if let Err(e) = result {
            log::warn!("Failed to persist identity, continuing session-only: {e}");
            self.store = None;
        }
    }
}

fn read_identity(store: &dyn KeyValueStore) -> Result<Option<Identity>, StoreError> {
    let Some(raw) = store.get(IDENTITY_KEY)? else {
        return Ok(None);
    };
    match serde_json::from_str::<Identity>(&raw) {
        Ok(identity) if !identity.uid.is_empty() => Ok(Some(identity)),
        Ok(_) | Err(_) => {
            log::warn!("Discarding unreadable identity blob");
            Ok(None)
        }
    }
}
