//! Persisted link records for Sidewalk with pluggable backends.
//!
//! The link keeps a handful of values that must survive a restart: the
//! local address and the receive counters used for replay protection. This
//! crate stores them as small checksummed records behind the [`KvStore`]
//! trait, with an in-memory backend for tests and a file backend for hosts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Identifies one persisted record
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum RecordKey {
    /// Local device address
    LocalAddress,
    /// Last accepted receive counter for a source, keyed by its raw address
    RxCounter(Vec<u8>),
}

impl RecordKey {
    /// Stable name used by backends
    pub fn name(&self) -> String {
        match self {
            RecordKey::LocalAddress => "local_address".to_string(),
            RecordKey::RxCounter(src) => {
                let hex: String = src.iter().map(|b| format!("{:02x}", b)).collect();
                format!("rx_counter_{}", hex)
            }
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Entry not found
    #[error("Entry not found")]
    NotFound,
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Non-volatile key-value store
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError>;

    /// Fetch the value under `key`
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove `key`; removing a missing key is not an error
    fn delete(&self, key: &RecordKey) -> Result<(), StorageError>;

    /// Make previous writes durable
    fn flush(&self) -> Result<(), StorageError>;
}

/// Store a serde value as JSON
pub fn put_json<T: Serialize>(
    store: &dyn KvStore,
    key: &RecordKey,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

/// Load a JSON record
pub fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &RecordKey,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// One checksummed file per record
    File {
        /// Data directory path
        data_dir: PathBuf,
        /// Fsync after every write
        fsync: bool,
    },
}

// Re-export backend implementations
pub use backend::file::{FileStore, FileStoreConfig};
pub use backend::mem::MemoryStore;

/// Open a store from configuration
pub fn open_store(mode: StorageMode) -> Result<Arc<dyn KvStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StorageMode::File { data_dir, fsync } => {
            Ok(Arc::new(FileStore::open(FileStoreConfig { data_dir, fsync })?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        counter: u32,
        label: String,
    }

    #[test]
    fn test_record_key_names() {
        assert_eq!(RecordKey::LocalAddress.name(), "local_address");
        assert_eq!(
            RecordKey::RxCounter(vec![0xA1, 0x02]).to_string(),
            "rx_counter_a102"
        );
    }

    #[test]
    fn test_json_helpers() {
        let store = open_store(StorageMode::InMemory).unwrap();
        let key = RecordKey::RxCounter(vec![1, 2, 3]);
        let value = Sample {
            counter: 42,
            label: "gw".to_string(),
        };

        assert_eq!(get_json::<Sample>(store.as_ref(), &key).unwrap(), None);
        put_json(store.as_ref(), &key, &value).unwrap();
        assert_eq!(get_json::<Sample>(store.as_ref(), &key).unwrap(), Some(value));
    }

    #[test]
    fn test_json_type_mismatch() {
        let store = MemoryStore::new();
        store.put(&RecordKey::LocalAddress, b"not json").unwrap();
        assert!(matches!(
            get_json::<Sample>(&store, &RecordKey::LocalAddress),
            Err(StorageError::Serialization(_))
        ));
    }
}
