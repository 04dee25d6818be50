//! Filesystem-backed blob store
//!
//! Blobs live at `<root>/<key>`. Expirations are kept in a parallel tree at
//! `<root>/.expiry/<key>` holding an RFC 3339 timestamp.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{validate_key, BlobStore, StorageError, StorageResult};

const EXPIRY_DIR: &str = ".expiry";

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        if key == EXPIRY_DIR || key.starts_with(&format!("{EXPIRY_DIR}/")) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn expiry_path(&self, key: &str) -> PathBuf {
        self.root.join(EXPIRY_DIR).join(key)
    }

    pub fn expires_at(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>> {
        self.blob_path(key)?;
        let path = self.expiry_path(key);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Delete every blob whose expiration is before `now`. Returns the number
    /// of blobs removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let expiry_root = self.root.join(EXPIRY_DIR);
        if !expiry_root.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in WalkDir::new(&expiry_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(relative) = entry.path().strip_prefix(&expiry_root) else {
                continue;
            };
            let key = relative.to_string_lossy().replace('\\', "/");
            let expired = self
                .expires_at(&key)
                .ok()
                .flatten()
                .is_some_and(|at| at < now);
            if !expired {
                continue;
            }

            for path in [self.root.join(&key), entry.path().to_path_buf()] {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove expired blob {}: {}", path.display(), e);
                    }
                }
            }
            debug!("Purged expired blob {}", key);
            removed += 1;
        }

        Ok(removed)
    }
}

fn write_file(path: &Path, body: &[u8], key: &str) -> StorageResult<()> {
    let io_err = |source| StorageError::Io {
        key: key.to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, body).map_err(io_err)
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;
        match std::fs::read(&path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn put(&self, key: &str, body: &[u8], expires_at: Option<DateTime<Utc>>) -> StorageResult<()> {
        let path = self.blob_path(key)?;
        write_file(&path, body, key)?;

        let expiry = self.expiry_path(key);
        match expires_at {
            Some(at) => write_file(&expiry, at.to_rfc3339().as_bytes(), key)?,
            None => {
                let _ = std::fs::remove_file(&expiry);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_roundtrip_and_missing() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("a/b/c.json", b"{}", None).unwrap();
        assert_eq!(store.get("a/b/c.json").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get("a/b/missing.json").unwrap(), None);
    }

    #[test]
    fn test_rejects_keys_outside_root() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../escape", b"x", None).is_err());
        assert!(store.put(".expiry/x", b"x", None).is_err());
    }

    #[test]
    fn test_purge_expired() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let now = Utc::now();

        store.put("q/old", b"1", Some(now - Duration::days(1))).unwrap();
        store.put("q/fresh", b"2", Some(now + Duration::days(7))).unwrap();
        store.put("q/forever", b"3", None).unwrap();

        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert_eq!(store.get("q/old").unwrap(), None);
        assert!(store.get("q/fresh").unwrap().is_some());
        assert!(store.get("q/forever").unwrap().is_some());
        assert!(store.expires_at("q/fresh").unwrap().is_some());
        assert!(store.expires_at("q/forever").unwrap().is_none());
    }
}
