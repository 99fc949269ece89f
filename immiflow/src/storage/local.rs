//! Filesystem-backed object store.

use super::{ObjectLocation, ObjectStore};
use crate::errors::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Object store that maps `bucket/key` onto `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Creates a store rooted at a directory. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, location: &ObjectLocation) -> Result<PathBuf, StoreError> {
        location.validate()?;
        let mut path = self.root.join(&location.bucket);
        path.extend(location.key.split('/'));
        Ok(path)
    }

    fn map_io(location: &ObjectLocation, path: &Path, source: std::io::Error) -> StoreError {
        if source.kind() == ErrorKind::NotFound {
            StoreError::not_found(&location.bucket, &location.key)
        } else {
            StoreError::Io {
                path: path.display().to_string(),
                source,
            }
        }
    }

    async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(location)?;
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Self::map_io(location, &path, e))?;
        tracing::debug!(location = %location, "Object written");
        Ok(())
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_io(location, &path, e))
    }

    async fn copy(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), StoreError> {
        let src = self.path_for(from)?;
        let dst = self.path_for(to)?;
        Self::ensure_parent(&dst).await?;
        tokio::fs::copy(&src, &dst)
            .await
            .map_err(|e| Self::map_io(from, &src, e))?;
        tracing::debug!(from = %from, to = %to, "Object copied");
        Ok(())
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), StoreError> {
        let path = self.path_for(location)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_io(location, &path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let loc = ObjectLocation::new("bucket", "staging/dims/country_codes.csv");

        store.put(&loc, b"code;name\n".to_vec()).await.unwrap();

        let on_disk = dir
            .path()
            .join("bucket/staging/dims/country_codes.csv");
        assert!(on_disk.exists());
        assert_eq!(store.get(&loc).await.unwrap(), b"code;name\n".to_vec());
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let loc = ObjectLocation::new("bucket", "nope.csv");

        assert!(store.get(&loc).await.unwrap_err().is_not_found());
        assert!(store.delete(&loc).await.unwrap_err().is_not_found());
        assert!(!store.exists(&loc).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_overwrites_destination() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let src = ObjectLocation::new("bucket", "raw/t.csv");
        let dst = ObjectLocation::new("bucket", "staging/t.csv");

        store.put(&dst, b"old".to_vec()).await.unwrap();
        store.put(&src, b"new".to_vec()).await.unwrap();
        store.copy(&src, &dst).await.unwrap();

        assert_eq!(store.get(&dst).await.unwrap(), b"new".to_vec());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .put(&ObjectLocation::new("bucket", "../x"), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
