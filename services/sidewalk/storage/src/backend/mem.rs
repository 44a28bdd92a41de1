//! In-memory storage backend

use crate::{KvStore, RecordKey, StorageError};
use dashmap::DashMap;

/// In-memory record store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        self.records.insert(key.name(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.get(&key.name()).map(|v| v.value().clone()))
    }

    fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.records.remove(&key.name());
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryStore::new();
        let key = RecordKey::LocalAddress;

        assert_eq!(store.get(&key).unwrap(), None);

        store.put(&key, b"first").unwrap();
        store.put(&key, b"second").unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"second".to_vec()));
        assert_eq!(store.len(), 1);

        store.delete(&key).unwrap();
        store.delete(&key).unwrap();
        assert!(store.is_empty());
    }
}
