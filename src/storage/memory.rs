//! In-process blob store, for dry runs and tests

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::{validate_key, BlobStore, StorageResult};

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<String, (Vec<u8>, Option<DateTime<Utc>>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.blobs.get(key).and_then(|entry| entry.value().1)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.blobs.get(key).map(|entry| entry.value().0.clone()))
    }

    fn put(&self, key: &str, body: &[u8], expires_at: Option<DateTime<Utc>>) -> StorageResult<()> {
        validate_key(key)?;
        self.blobs
            .insert(key.to_string(), (body.to_vec(), expires_at));
        Ok(())
    }
}
