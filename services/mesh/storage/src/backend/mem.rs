//! In-memory storage backend for development and testing

use crate::{validate_name, KeyStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory key/value store
#[derive(Clone, Default)]
pub struct MemoryStore {
    /// (namespace, key) -> value
    values: Arc<DashMap<(String, String), Bytes>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_name(namespace)?;
        validate_name(key)?;
        Ok(self
            .values
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.to_vec()))
    }

    async fn store(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_name(namespace)?;
        validate_name(key)?;
        debug!("Store {}/{} len={}", namespace, key, value.len());
        self.values.insert(
            (namespace.to_string(), key.to_string()),
            Bytes::copy_from_slice(value),
        );
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        validate_name(namespace)?;
        validate_name(key)?;
        debug!("Remove {}/{}", namespace, key);
        self.values.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert_eq!(store.load("keys", "public").await.unwrap(), None);

        store.store("keys", "public", b"abc").await.unwrap();
        assert_eq!(store.load("keys", "public").await.unwrap(), Some(b"abc".to_vec()));

        store.store("keys", "public", b"xyz").await.unwrap();
        assert_eq!(store.load("keys", "public").await.unwrap(), Some(b"xyz".to_vec()));
        assert_eq!(store.len(), 1);

        store.remove("keys", "public").await.unwrap();
        store.remove("keys", "public").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.store("peers", "table", &[9]).await.unwrap();
        assert_eq!(other.load("peers", "table").await.unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_bad_names() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.store("../etc", "x", b"1").await,
            Err(StorageError::Invalid(_))
        ));
    }
}
