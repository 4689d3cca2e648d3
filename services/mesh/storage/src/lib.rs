//! Persisted state for the bulb tools: enrolled bulbs, network key and
//! sequence counters.
//!
//! This crate provides a small key-value contract ([`ConfigStore`]) with
//! pluggable backends (in-memory, JSON file) and a typed [`Registry`] on top
//! that knows the keys the rest of the workspace relies on.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored value has the wrong shape
    #[error("Invalid value for {key}: {reason}")]
    Invalid {
        /// Key being read
        key: String,
        /// What was wrong
        reason: String,
    },
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value contract for persisted configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a value, `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a value, durable once this returns
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove a key, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// Single JSON document on disk
    File {
        /// Path of the JSON file
        path: PathBuf,
    },
}

// Re-export backend implementations
pub use backend::file::FileStore;
pub use backend::mem::MemoryStore;
pub use registry::{keys, BulbRecord, DeviceIdentity, Registry, TargetSelector};

/// Open a store for the given mode
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn ConfigStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StorageMode::File { path } => Ok(Arc::new(FileStore::open(path).await?)),
    }
}
