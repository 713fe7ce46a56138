//! File-based storage backend: one file per value, replaced atomically

use crate::{validate_name, KeyStore, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const TMP_SUFFIX: &str = ".tmp";

/// Store rooted at a data directory, laid out as `<data_dir>/<namespace>/<key>`
#[derive(Clone, Debug)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the data directory
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        info!("File store at {}", data_dir.display());
        Ok(Self { data_dir })
    }

    /// Root directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn value_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_name(namespace)?;
        validate_name(key)?;
        Ok(self.data_dir.join(namespace).join(key))
    }
}

#[async_trait]
impl KeyStore for FileStore {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.value_path(namespace, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.value_path(namespace, key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        // write the sibling temp file, then rename over the old value
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(value).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Stored {}/{} len={}", namespace, key, value.len());
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let path = self.value_path(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed {}/{}", namespace, key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_basic() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();

        assert_eq!(store.load("keys", "private").await.unwrap(), None);
        store.store("keys", "private", &[7u8; 32]).await.unwrap();
        assert_eq!(
            store.load("keys", "private").await.unwrap(),
            Some(vec![7u8; 32])
        );
        assert!(temp_dir.path().join("keys").join("private").exists());
        assert!(!temp_dir.path().join("keys").join("private.tmp").exists());

        store.remove("keys", "private").await.unwrap();
        store.remove("keys", "private").await.unwrap();
        assert_eq!(store.load("keys", "private").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(temp_dir.path()).await.unwrap();
            store.store("peers", "table", b"first").await.unwrap();
            store.store("peers", "table", b"second").await.unwrap();
        }

        let store = FileStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(
            store.load("peers", "table").await.unwrap(),
            Some(b"second".to_vec())
        );
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        assert!(store.load("..", "passwd").await.is_err());
        assert!(store.store("keys", "a/b", b"x").await.is_err());
    }
}
