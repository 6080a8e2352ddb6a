//! Persistent key/value state shared with the rest of the app
//!
//! The session manager, selection policy, catalog cache and key store all
//! persist small pieces of state under well-known keys:
//! - last known connection boolean and connection start timestamp
//! - the selected server snapshot
//! - the raw catalog document
//! - the local key pair
//!
//! `FileStore` keeps everything in a single JSON document on disk. A missing
//! or corrupted file is treated as an empty store so the client can always
//! start fresh.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

/// Well-known store keys
pub mod keys {
    /// Last boolean connection state observed by reconciliation
    pub const LAST_CONNECTION_STATE: &str = "lastConnectionState";
    /// Timestamp of the start of the current connection
    pub const LAST_CONNECTED_DATE: &str = "lastConnectedDate";
    /// Snapshot of the selected server
    pub const CURRENT_SERVER: &str = "currentServer";
    /// Raw catalog document bytes (base64)
    pub const CACHED_SERVER_JSON: &str = "cachedServerJSON";
    /// Local tunnel private key (base64)
    pub const PRIVATE_KEY: &str = "privateKey";
    /// Local tunnel public key (base64)
    pub const PUBLIC_KEY: &str = "publicKey";
}

/// Key/value storage capability
pub trait KeyValueStore: Send + Sync {
    /// Read a raw JSON value
    fn get(&self, key: &str) -> Option<Value>;

    /// Write a raw JSON value
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Remove a value (no-op if absent)
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl dyn KeyValueStore {
    /// Read and decode a typed value.
    ///
    /// Values that no longer decode are reported and treated as absent.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Ignoring undecodable value for {}: {}", key, e);
                None
            }
        }
    }

    /// Encode and write a typed value
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|e| StoreError::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set(key, value)
    }

    /// Read opaque bytes
    pub fn load_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let encoded: String = self.load(key)?;
        BASE64.decode(encoded).ok()
    }

    /// Write opaque bytes verbatim
    pub fn save_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.set(key, Value::String(BASE64.encode(bytes)))
    }
}

/// Get platform-specific default state file path
pub fn default_state_file() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from(r"C:\ProgramData\SkyLink\state.json")
    }

    #[cfg(not(target_os = "windows"))]
    {
        PathBuf::from("/var/lib/skylink/state.json")
    }
}

/// JSON document store backed by a single file
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileStore {
    /// Open the store, loading any existing document
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = read_document(&path);
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn values(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self, values: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let write_err = |reason: String| StoreError::Write {
            path: self.path.display().to_string(),
            reason,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750)).ok();
                }
            }
        }

        let json = serde_json::to_string_pretty(values).map_err(|e| write_err(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| write_err(e.to_string()))?;

        // Holds key material, keep it away from other users
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!("Failed to restrict permissions on {:?}: {}", self.path, e);
            }
        }

        tracing::debug!("Saved state to {:?}", self.path);
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self.values();
        values.insert(key.to_string(), value);
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values();
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}

/// Load the state document, treating any failure as an empty store
fn read_document(path: &Path) -> BTreeMap<String, Value> {
    match std::fs::read_to_string(path) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(values) => {
                tracing::debug!("Loaded state from {:?}", path);
                values
            }
            Err(e) => {
                tracing::warn!("Failed to parse state file: {} - starting fresh", e);
                BTreeMap::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No state file found at {:?}", path);
            BTreeMap::new()
        }
        Err(e) => {
            tracing::warn!("Failed to read state file: {}", e);
            BTreeMap::new()
        }
    }
}

/// In-memory store (tests, dry runs)
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}
