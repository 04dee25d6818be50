//! Blame result caching
//!
//! One [`BlameCache`] is built per file-processing unit and shared by every
//! resource of that file. Entries are never invalidated during a run: a run
//! works against one clone, so the same key always yields the same result.

pub mod paths;

pub use paths::{default_clone_root, default_storage_root, default_violations_dir};

use crate::git::resolver::LineSelection;
use crate::models::BlameAttribution;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cache key. Tenant and file are part of the key so entries never collide
/// across tenants or files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlameCacheKey {
    pub tenant: String,
    pub start_line: u32,
    pub end_line: u32,
    pub file_path: String,
}

impl BlameCacheKey {
    pub fn new(tenant: &str, selection: LineSelection, file_path: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            start_line: selection.start_line,
            end_line: selection.end_line,
            file_path: file_path.to_string(),
        }
    }
}

/// Thread-safe attribution cache
#[derive(Clone, Default)]
pub struct BlameCache {
    entries: Arc<DashMap<BlameCacheKey, BlameAttribution>>,
    hits: Arc<AtomicUsize>,
    misses: Arc<AtomicUsize>,
}

impl BlameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BlameCacheKey) -> Option<BlameAttribution> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store an attribution. Concurrent writers for one key compute the same
    /// value, so the last one simply wins.
    pub fn insert(&self, key: BlameCacheKey, attribution: BlameAttribution) {
        self.entries.insert(key, attribution);
    }

    /// Return the cached attribution for `key`, or compute and store it.
    ///
    /// Errors are not cached.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: BlameCacheKey,
        compute: impl FnOnce() -> Result<BlameAttribution, E>,
    ) -> Result<BlameAttribution, E> {
        if let Some(cached) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let attribution = compute()?;
        self.insert(key, attribution.clone());
        Ok(attribution)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<BlameCacheKey> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    /// Cache stats as `(hits, misses)`
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
