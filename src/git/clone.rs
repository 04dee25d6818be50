//! Clone lifecycle management
//!
//! Clones are large and the execution environment's disk is small, so a clone
//! directory only ever lives as long as its [`ClonedRepository`] handle. The
//! target directory is cleared before cloning and removed again when the
//! handle drops, whichever way the caller leaves its scope.

use git2::build::CheckoutBuilder;
use git2::Repository;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::paths::clone_dir;
use crate::models::RepositoryRef;

/// stderr marker git prints when `--branch` names a branch the remote lacks.
pub const BRANCH_NOT_FOUND_MARKER: &str = "Could not find remote branch";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Authenticated clone URL handed to us by a VCS adapter.
///
/// The URL carries credentials, so `Display` and `Debug` only show a redacted
/// form. Use [`CloneUrl::expose`] to get the real value for git.
#[derive(Clone, PartialEq, Eq)]
pub struct CloneUrl(String);

impl CloneUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The URL with any userinfo replaced by `***`.
    pub fn redacted(&self) -> String {
        let Some((scheme, rest)) = self.0.split_once("://") else {
            return self.0.clone();
        };
        let authority_end = rest.find('/').unwrap_or(rest.len());
        match rest[..authority_end].rfind('@') {
            Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
            None => self.0.clone(),
        }
    }

    /// Swap the `owner/name` segment for another one, used to clone forks
    /// with the credentials of the parent repository.
    pub fn with_repository(&self, from: &str, to: &str) -> CloneUrl {
        match self.0.split_once(from) {
            Some((head, tail)) => CloneUrl(format!("{}{}{}", head, to, tail)),
            None => self.clone(),
        }
    }
}

impl fmt::Display for CloneUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for CloneUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloneUrl({})", self.redacted())
    }
}

#[derive(Debug, Error)]
pub enum CloneError {
    /// The requested branch does not exist on the remote. Callers may fall
    /// back to a full clone plus checkout.
    #[error("remote branch '{branch}' not found for {repository}")]
    BranchNotFound { repository: String, branch: String },

    #[error("clone of {repository} failed: {message}")]
    Failed { repository: String, message: String },

    #[error("checkout of {commit} in {repository} failed: {source}")]
    Checkout {
        repository: String,
        commit: String,
        #[source]
        source: git2::Error,
    },

    #[error("failed to prepare clone directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CloneError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CloneError::BranchNotFound { .. })
    }
}

/// How much of the repository to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneMode {
    /// No working tree; enough for blame and log.
    Bare,
    /// Full clone with working tree.
    Full,
    /// `--depth 1 --single-branch --branch <branch>`
    Shallow { branch: String },
}

impl CloneMode {
    fn args(&self) -> Vec<String> {
        match self {
            CloneMode::Bare => vec!["--bare".into()],
            CloneMode::Full => vec![],
            CloneMode::Shallow { branch } => vec![
                "--depth".into(),
                "1".into(),
                "--single-branch".into(),
                "--branch".into(),
                branch.clone(),
            ],
        }
    }
}

/// A clone on disk. Dropping the handle deletes the directory.
#[derive(Debug)]
pub struct ClonedRepository {
    path: PathBuf,
    is_bare: bool,
    size_on_disk_mb: f64,
    clone_duration_ms: u128,
}

impl ClonedRepository {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_bare(&self) -> bool {
        self.is_bare
    }

    pub fn size_on_disk_mb(&self) -> f64 {
        self.size_on_disk_mb
    }

    pub fn clone_duration_ms(&self) -> u128 {
        self.clone_duration_ms
    }
}

impl Drop for ClonedRepository {
    fn drop(&mut self) {
        match remove_dir_if_exists(&self.path) {
            Ok(()) => debug!("Removed clone directory {}", self.path.display()),
            Err(e) => warn!(
                "Failed to remove clone directory {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Performs clones under a root directory, one directory per tenant and
/// repository.
#[derive(Debug, Clone)]
pub struct CloneManager {
    root: PathBuf,
    excluded: HashSet<String>,
}

impl CloneManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: HashSet::new(),
        }
    }

    /// Repositories (`owner/name`) that are never cloned, typically because
    /// they are too large for the environment.
    pub fn with_exclusions<I, S>(mut self, repositories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded
            .extend(repositories.into_iter().map(Into::into));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_excluded(&self, repository: &RepositoryRef) -> bool {
        self.excluded.contains(&repository.full_name())
    }

    pub fn clone_dir(&self, tenant: &str, repository: &RepositoryRef) -> PathBuf {
        clone_dir(&self.root, tenant, &repository.owner, &repository.name)
    }

    /// Clone `repository` for `tenant`.
    pub fn clone_repository(
        &self,
        tenant: &str,
        repository: &RepositoryRef,
        url: &CloneUrl,
        mode: &CloneMode,
    ) -> Result<ClonedRepository, CloneError> {
        let path = self.clone_dir(tenant, repository);
        let io_err = |source| CloneError::Io {
            path: path.clone(),
            source,
        };

        remove_dir_if_exists(&path).map_err(io_err)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        // From here on the handle owns the directory: every early return
        // below drops it and removes whatever git left behind.
        let mut handle = ClonedRepository {
            path,
            is_bare: *mode == CloneMode::Bare,
            size_on_disk_mb: 0.0,
            clone_duration_ms: 0,
        };

        info!(
            "Cloning {} ({:?}) from {} into {}",
            repository,
            mode,
            url,
            handle.path.display()
        );
        let started = Instant::now();
        let output = Command::new("git")
            .arg("clone")
            .args(mode.args())
            .arg(url.expose())
            .arg(&handle.path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| CloneError::Failed {
                repository: repository.full_name(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr)
                .replace(url.expose(), &url.redacted());
            if let CloneMode::Shallow { branch } = mode {
                if stderr.contains(BRANCH_NOT_FOUND_MARKER) {
                    return Err(CloneError::BranchNotFound {
                        repository: repository.full_name(),
                        branch: branch.clone(),
                    });
                }
            }
            return Err(CloneError::Failed {
                repository: repository.full_name(),
                message: stderr.trim().to_string(),
            });
        }

        handle.clone_duration_ms = started.elapsed().as_millis();
        handle.size_on_disk_mb = bytes_to_mb(directory_size_bytes(&handle.path));
        info!(
            "Cloned {} in {}ms ({:.2} MB)",
            repository, handle.clone_duration_ms, handle.size_on_disk_mb
        );
        Ok(handle)
    }

    /// Shallow single-branch clone, falling back to a full clone and a
    /// detached checkout of `commit` when the branch is missing on the remote.
    pub fn clone_with_fallback(
        &self,
        tenant: &str,
        repository: &RepositoryRef,
        url: &CloneUrl,
        branch: &str,
        commit: Option<&str>,
    ) -> Result<ClonedRepository, CloneError> {
        let shallow = CloneMode::Shallow {
            branch: branch.to_string(),
        };
        match self.clone_repository(tenant, repository, url, &shallow) {
            Err(e) if e.is_recoverable() => {
                warn!("{}; cloning the full repository instead", e);
                let handle = self.clone_repository(tenant, repository, url, &CloneMode::Full)?;
                if let Some(commit) = commit {
                    checkout_commit(&handle, repository, commit)?;
                }
                Ok(handle)
            }
            other => other,
        }
    }
}

/// Detach HEAD at `commit` and force the working tree to match.
fn checkout_commit(
    handle: &ClonedRepository,
    repository: &RepositoryRef,
    commit: &str,
) -> Result<(), CloneError> {
    let checkout_err = |source| CloneError::Checkout {
        repository: repository.full_name(),
        commit: commit.to_string(),
        source,
    };

    let repo = Repository::open(handle.path()).map_err(checkout_err)?;
    let target = repo
        .revparse_single(commit)
        .and_then(|obj| obj.peel_to_commit())
        .map_err(checkout_err)?;
    repo.set_head_detached(target.id()).map_err(checkout_err)?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))
        .map_err(checkout_err)?;
    debug!("Checked out {} in {}", commit, handle.path().display());
    Ok(())
}

/// Total size of regular files below `path`, from metadata only.
pub fn directory_size_bytes(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
