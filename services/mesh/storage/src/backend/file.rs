//! File-based storage backend: one pretty-printed JSON object.
//!
//! The document is loaded once at open and rewritten in full on every
//! mutation (temp file + rename). No locking across processes.

use crate::{ConfigStore, StorageError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// JSON file config store
pub struct FileStore {
    path: PathBuf,
    document: RwLock<Map<String, Value>>,
}

impl FileStore {
    /// Open the store, starting empty when the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Map::new(),
            Ok(content) => match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => map,
                _ => {
                    return Err(StorageError::Invalid {
                        key: path.display().to_string(),
                        reason: "config file is not a JSON object".to_string(),
                    })
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, starting empty", path.display());
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded {} config keys from {}", document.len(), path.display());

        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, document: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        restrict_permissions(&self.path).await;
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let perms = std::fs::Permissions::from_mode(0o660);
    if let Err(e) = tokio::fs::set_permissions(path, perms).await {
        warn!("Could not set permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.document.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut document = self.document.write().await;
        document.insert(key.to_string(), value);
        self.persist(&document).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let mut document = self.document.write().await;
        let existed = document.remove(key).is_some();
        if existed {
            self.persist(&document).await?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ilumi_config.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.set("network_key", json!(305419896)).await.unwrap();
            store.set("seq_num", json!(12)).await.unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.get("network_key").await.unwrap(), Some(json!(305419896)));
        assert_eq!(store.get("seq_num").await.unwrap(), Some(json!(12)));
        assert!(!temp_dir.path().join("ilumi_config.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(store.get("bulbs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_rejects_non_object() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(
            FileStore::open(&path).await,
            Err(StorageError::Invalid { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("perm.json");
        let store = FileStore::open(&path).await.unwrap();
        store.set("dfu_key", json!(1)).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }
}
