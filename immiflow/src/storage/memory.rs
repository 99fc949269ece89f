//! In-memory object store.

use super::{ObjectLocation, ObjectStore};
use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;

/// Object store backed by a concurrent map. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<ObjectLocation, Vec<u8>>,
}

impl InMemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns the sorted keys stored in a bucket.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().bucket == bucket)
            .map(|entry| entry.key().key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<(), StoreError> {
        location.validate()?;
        self.objects.insert(location.clone(), bytes);
        Ok(())
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StoreError> {
        location.validate()?;
        self.objects
            .get(location)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::not_found(&location.bucket, &location.key))
    }

    async fn copy(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), StoreError> {
        to.validate()?;
        let bytes = self.get(from).await?;
        self.objects.insert(to.clone(), bytes);
        Ok(())
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), StoreError> {
        location.validate()?;
        self.objects
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(&location.bucket, &location.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let store = InMemoryObjectStore::new();
        let loc = ObjectLocation::new("bucket", "a/b.csv");

        store.put(&loc, b"one".to_vec()).await.unwrap();
        store.put(&loc, b"two".to_vec()).await.unwrap();

        assert_eq!(store.get(&loc).await.unwrap(), b"two".to_vec());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let store = InMemoryObjectStore::new();
        let src = ObjectLocation::new("bucket", "raw/x.csv");
        let dst = ObjectLocation::new("bucket", "staging/y.csv");

        store.put(&src, b"data".to_vec()).await.unwrap();
        store.copy(&src, &dst).await.unwrap();
        assert_eq!(store.get(&dst).await.unwrap(), b"data".to_vec());
        assert_eq!(store.keys("bucket"), vec!["raw/x.csv", "staging/y.csv"]);

        store.delete(&dst).await.unwrap();
        assert!(store.delete(&dst).await.unwrap_err().is_not_found());
        assert!(!store.exists(&dst).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_missing_source() {
        let store = InMemoryObjectStore::new();
        let err = store
            .copy(&ObjectLocation::new("b", "missing"), &ObjectLocation::new("b", "dst"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
