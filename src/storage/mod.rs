//! Blob storage boundary
//!
//! Staged violation batches are read from, and attribution chunks and clone
//! logs are written to, a key/value blob store. Writes can carry an
//! expiration: nothing we stage is meant to be permanent.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid blob key '{0}'")]
    InvalidKey(String),

    #[error("I/O error on blob '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize blob '{key}': {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key/value object storage.
pub trait BlobStore: Send + Sync {
    /// Read a blob. A missing key is `Ok(None)`.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write a blob, replacing any previous value.
    fn put(&self, key: &str, body: &[u8], expires_at: Option<DateTime<Utc>>) -> StorageResult<()>;
}

/// Read and deserialize a JSON blob.
pub fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> StorageResult<Option<T>> {
    let Some(body) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|source| StorageError::Json {
            key: key.to_string(),
            source,
        })
}

/// Serialize and write a JSON blob.
pub fn put_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
    expires_at: Option<DateTime<Utc>>,
) -> StorageResult<()> {
    let body = serde_json::to_vec(value).map_err(|source| StorageError::Json {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &body, expires_at)
}

/// Expiration `days` from now.
pub fn expires_in_days(days: u32) -> DateTime<Utc> {
    Utc::now() + Duration::days(i64::from(days))
}

/// Keys are relative `/`-separated paths without `.`/`..` segments.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
