//! In-memory storage backend for development and testing

use crate::{ConfigStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// In-memory config store
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<DashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        debug!("Config set key={}", key);
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.values.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("network_key").await.unwrap(), None);

        store.set("network_key", json!(42)).await.unwrap();
        assert_eq!(store.get("network_key").await.unwrap(), Some(json!(42)));
        assert_eq!(store.len(), 1);

        assert!(store.remove("network_key").await.unwrap());
        assert!(!store.remove("network_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("seq_num", json!(6)).await.unwrap();
        assert_eq!(other.get("seq_num").await.unwrap(), Some(json!(6)));
    }
}
