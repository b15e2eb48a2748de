//! Durable key-value storage
//!
//! This module provides:
//! - The `KeyValueStore` trait every other component reads/writes through
//! - `MemoryStore` for session-scoped storage and tests
//! - `FileStore` for durable on-disk storage
//! - The enumerated registry of storage key names, legacy aliases included

mod keys;

pub use keys::StorageKeys;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use crate::Result;
use crate::error::Error;

/// Thin wrapper over durable string storage
///
/// Only two components write through this: the session store (under the
/// session key) and the OAuth recovery coordinator (under the flow keys).
/// The namespaces are disjoint, so no cross-component locking is needed.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any
    fn get(&self, key: &str) -> Option<String>;

    /// Write `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store, used for session-scoped storage and in tests
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|map| map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        map.remove(key);
        Ok(())
    }
}

/// File-backed store: one file per key under a directory
///
/// Writes go through a temp-file rename so a crash mid-write never leaves
/// a partially written value.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Store under the default app data directory (`~/.mesa/auth`)
    pub fn default_location() -> Self {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mesa")
            .join("auth");
        Self::new(dir)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Key names contain dots and dashes but no path separators
        let safe: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(safe)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        // Keys contain dots, so append rather than replace an "extension"
        let tmp = self.dir.join(format!(
            "{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("key")
        ));
        std::fs::write(&tmp, value)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp, perms)?;
        }

        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
