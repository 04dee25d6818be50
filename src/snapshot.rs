//! Repository snapshots for scanning
//!
//! Shallow-clones one branch of each repository and copies its files into
//! the blob store under a scan prefix, where the scanners pick them up.

use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::git::{CloneManager, CloneMode, CloneUrl, ClonedRepository};
use crate::models::RepositoryRef;
use crate::storage::BlobStore;
use crate::vcs::{CloneUrlRequest, CloneUrlResolver, VcsKind};

/// Files this large or larger are not uploaded.
pub const MAX_UPLOAD_FILE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// A repository to snapshot, optionally from a fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTarget {
    #[serde(flatten)]
    pub repository: RepositoryRef,
    /// `owner/name` of a fork to clone with the parent's credentials
    #[serde(default, rename = "fullForkedRepoName")]
    pub fork: Option<String>,
}

impl From<RepositoryRef> for SnapshotTarget {
    fn from(repository: RepositoryRef) -> Self {
        Self {
            repository,
            fork: None,
        }
    }
}

/// Where a scanner finds a repository's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPath {
    pub owner: String,
    pub name: String,
    pub path: String,
    pub public: bool,
    pub is_repo_on_black_list: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploaded: usize,
    pub skipped_large: usize,
    pub skipped_symlinks: usize,
    pub bytes: u64,
}

pub struct Snapshotter {
    clones: CloneManager,
    urls: Arc<dyn CloneUrlResolver>,
    store: Arc<dyn BlobStore>,
    max_file_bytes: u64,
}

impl Snapshotter {
    pub fn new(
        clones: CloneManager,
        urls: Arc<dyn CloneUrlResolver>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            clones,
            urls,
            store,
            max_file_bytes: MAX_UPLOAD_FILE_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    /// Snapshot every target under `prefix` and return the scan paths.
    ///
    /// Clone URLs are resolved for all targets first. Excluded repositories
    /// are not cloned but still listed, flagged `isRepoOnBlackList`. Any
    /// clone or upload failure aborts the whole snapshot.
    pub fn snapshot_repositories(
        &self,
        tenant: &str,
        kind: VcsKind,
        targets: &[SnapshotTarget],
        prefix: &str,
        commit: Option<&str>,
    ) -> Result<Vec<ScanPath>> {
        let mut urls = Vec::with_capacity(targets.len());
        for target in targets {
            if self.clones.is_excluded(&target.repository) {
                urls.push(None);
                continue;
            }
            let request = CloneUrlRequest {
                tenant: tenant.to_string(),
                kind,
                owner: target.repository.owner.clone(),
                name: target.repository.name.clone(),
            };
            let url = self
                .urls
                .resolve(&request)
                .with_context(|| format!("No clone URL for {}", target.repository))?;
            urls.push(Some(url));
        }

        for (target, url) in targets.iter().zip(urls) {
            match url {
                Some(url) => {
                    self.snapshot_repository(tenant, target, &url, prefix, commit)?;
                }
                None => info!(
                    "{} is on the exclusion list, not snapshotted",
                    target.repository
                ),
            }
        }

        Ok(targets
            .iter()
            .map(|target| ScanPath {
                owner: target.repository.owner.clone(),
                name: target.repository.name.clone(),
                path: prefix.to_string(),
                public: false,
                is_repo_on_black_list: self.clones.is_excluded(&target.repository),
            })
            .collect())
    }

    /// Clone one repository and upload its files under `prefix`.
    pub fn snapshot_repository(
        &self,
        tenant: &str,
        target: &SnapshotTarget,
        url: &CloneUrl,
        prefix: &str,
        commit: Option<&str>,
    ) -> Result<UploadStats> {
        let repository = &target.repository;
        let url = match &target.fork {
            Some(fork) => {
                info!("Cloning fork {} of {}", fork, repository);
                url.with_repository(&repository.full_name(), fork)
            }
            None => url.clone(),
        };

        let clone = self.clone_target(tenant, repository, &url, commit)?;
        let stats = self.upload_dir(&clone, prefix)?;
        info!(
            "Uploaded {} files ({} bytes) of {} to {}",
            stats.uploaded, stats.bytes, repository, prefix
        );
        Ok(stats)
    }

    fn clone_target(
        &self,
        tenant: &str,
        repository: &RepositoryRef,
        url: &CloneUrl,
        commit: Option<&str>,
    ) -> Result<ClonedRepository> {
        let clone = match &repository.branch {
            Some(branch) => self
                .clones
                .clone_with_fallback(tenant, repository, url, branch, commit)?,
            None => {
                let clone =
                    self.clones
                        .clone_repository(tenant, repository, url, &CloneMode::Full)?;
                if commit.is_some() {
                    warn!(
                        "{} has no branch; snapshotting the default branch as cloned",
                        repository
                    );
                }
                clone
            }
        };
        Ok(clone)
    }

    fn upload_dir(&self, clone: &ClonedRepository, prefix: &str) -> Result<UploadStats> {
        let root = clone.path();
        let prefix = prefix.trim_end_matches('/');
        let mut stats = UploadStats::default();
        let mut files: Vec<(PathBuf, String, u64)> = Vec::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if entry.path_is_symlink() {
                stats.skipped_symlinks += 1;
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size >= self.max_file_bytes {
                debug!("Skipping {} ({} bytes)", entry.path().display(), size);
                stats.skipped_large += 1;
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| anyhow!("{} is outside the clone", entry.path().display()))?
                .to_string_lossy()
                .replace('\\', "/");
            let key = if prefix.is_empty() {
                relative
            } else {
                format!("{}/{}", prefix, relative)
            };
            files.push((entry.path().to_path_buf(), key, size));
        }

        files
            .par_iter()
            .map(|(path, key, _)| {
                let body = std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                self.store
                    .put(key, &body, None)
                    .with_context(|| format!("Failed to upload {}", key))
            })
            .collect::<Result<Vec<()>>>()?;

        stats.uploaded = files.len();
        stats.bytes = files.iter().map(|(_, _, size)| size).sum();
        Ok(stats)
    }
}
