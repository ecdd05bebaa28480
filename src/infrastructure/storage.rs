//! Local key-value persistence
//!
//! The harvester keeps four independent records (remembered ids, resume
//! cursor, crawl run state, aggregate) under fixed keys. Each record can be
//! loaded or cleared on its own; nothing else is stored.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed keys of the persisted records
pub mod keys {
    /// Newline-delimited set of remembered post ids
    pub const REMEMBERED_IDS: &str = "remembered_ids_v1";
    /// `{ id, exclusive }`
    pub const RESUME_CURSOR: &str = "resume_cursor_v1";
    /// Multi-page crawl run record
    pub const CRAWL_RUN_STATE: &str = "crawl_run_state_v1";
    /// Per-run aggregate of post side data
    pub const AGGREGATE: &str = "crawl_run_aggregate_v1";
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error for '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage is unavailable: {0}")]
    Unavailable(String),
}

/// Minimal string key-value store backing the checkpoint and crawl-run records
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store; writes can be made to fail for exercising degraded paths
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `set`/`remove` fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// One file per key under a root directory; writes go through a temp file and rename
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{file_name}.dat"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { key: key.to_string(), source }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let target = self.path_for(key);
        let tmp = target.with_extension("tmp");
        let io_err = |source| StorageError::Io { key: key.to_string(), source };

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(value.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &target).map_err(io_err)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { key: key.to_string(), source }),
        }
    }
}

/// Loads a JSON record; missing, unreadable and malformed records all read as `None`
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) if !raw.trim().is_empty() => raw,
        Ok(_) => return None,
        Err(e) => {
            warn!("⚠️ Failed to read '{}': {}", key, e);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("⚠️ Discarding malformed record '{}': {}", key, e);
            None
        }
    }
}

/// Saves a JSON record; returns whether the write reached the store
pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> bool {
    let result = serde_json::to_string(value)
        .map_err(|source| StorageError::Serialization { key: key.to_string(), source })
        .and_then(|raw| store.set(key, &raw));

    match result {
        Ok(()) => {
            debug!("Saved record '{}'", key);
            true
        }
        Err(e) => {
            warn!("⚠️ Failed to save '{}': {}", key, e);
            false
        }
    }
}

/// Removes a record, logging failures
pub fn clear(store: &dyn KeyValueStore, key: &str) -> bool {
    match store.remove(key) {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️ Failed to clear '{}': {}", key, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        exclusive: bool,
    }

    #[test]
    fn file_store_roundtrip_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("nested")).unwrap();

        assert_eq!(store.get(keys::RESUME_CURSOR).unwrap(), None);
        store.set(keys::RESUME_CURSOR, "abc").unwrap();
        assert_eq!(store.get(keys::RESUME_CURSOR).unwrap().as_deref(), Some("abc"));

        store.remove(keys::RESUME_CURSOR).unwrap();
        store.remove(keys::RESUME_CURSOR).unwrap();
        assert_eq!(store.get(keys::RESUME_CURSOR).unwrap(), None);
    }

    #[test]
    fn records_are_independent() {
        let store = MemoryStore::new();
        let record = Record { id: "1".into(), exclusive: true };
        assert!(save_json(&store, keys::RESUME_CURSOR, &record));
        assert!(save_json(&store, keys::AGGREGATE, &vec![1, 2, 3]));

        assert!(clear(&store, keys::AGGREGATE));
        assert_eq!(load_json::<Record>(&store, keys::RESUME_CURSOR), Some(record));
        assert_eq!(load_json::<Vec<u32>>(&store, keys::AGGREGATE), None);
    }

    #[test]
    fn malformed_record_reads_as_none() {
        let store = MemoryStore::new();
        store.set(keys::CRAWL_RUN_STATE, "{not json").unwrap();
        assert_eq!(load_json::<Record>(&store, keys::CRAWL_RUN_STATE), None);
    }

    #[test]
    fn failed_writes_are_reported_not_raised() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(!save_json(&store, keys::RESUME_CURSOR, &Record { id: "x".into(), exclusive: false }));
        assert!(!clear(&store, keys::RESUME_CURSOR));
        store.set_fail_writes(false);
        assert!(save_json(&store, keys::RESUME_CURSOR, &Record { id: "x".into(), exclusive: false }));
    }
}
