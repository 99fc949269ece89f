//! Object storage for raw and staged artifacts.
//!
//! Staging keys follow `{logical-path}/{artifact-name}`. Stores overwrite on
//! `put` and `copy`, and report a missing object on `delete` as
//! [`StoreError::NotFound`] so callers can decide whether that matters.

mod local;
mod memory;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Address of one object: a bucket plus a `/`-separated key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl ObjectLocation {
    /// Creates a location from a bucket and key.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Creates a location for `{prefix}/{name}` within a bucket.
    #[must_use]
    pub fn under(bucket: impl Into<String>, prefix: &str, name: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let key = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        Self::new(bucket, key)
    }

    /// Returns the final path segment of the key.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Rejects empty keys and keys that could escape the bucket.
    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        let bad_segment = |s: &str| s.is_empty() || s == "." || s == "..";
        if bad_segment(&self.bucket) || self.bucket.contains('/') {
            return Err(StoreError::InvalidKey(self.to_string()));
        }
        if self.key.starts_with('/') || self.key.split('/').any(bad_segment) {
            return Err(StoreError::InvalidKey(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A bucket plus a key prefix that artifacts are named under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPrefix {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix, without a trailing `/`.
    pub prefix: String,
}

impl ObjectPrefix {
    /// Creates a prefix.
    #[must_use]
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Location of `name` under this prefix.
    #[must_use]
    pub fn object(&self, name: &str) -> ObjectLocation {
        ObjectLocation::under(self.bucket.clone(), &self.prefix, name)
    }
}

impl fmt::Display for ObjectPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.prefix.trim_end_matches('/'))
    }
}

/// Blob storage used for raw extracts and staged artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    /// Writes an object, replacing any existing one.
    async fn put(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Reads an object.
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StoreError>;

    /// Copies an object, replacing the destination.
    async fn copy(&self, from: &ObjectLocation, to: &ObjectLocation) -> Result<(), StoreError>;

    /// Deletes an object. Missing objects yield [`StoreError::NotFound`].
    async fn delete(&self, location: &ObjectLocation) -> Result<(), StoreError>;

    /// Returns true if the object exists.
    async fn exists(&self, location: &ObjectLocation) -> Result<bool, StoreError> {
        match self.get(location).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
