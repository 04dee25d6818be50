//! Sources of violations pending attribution

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::cache::paths::clone_dir;
use crate::models::ViolationResource;

/// Pending violations for one repository. Large batches are staged in the
/// blob store and only their key is handed over.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAttributions {
    Inline(Vec<ViolationResource>),
    Staged { key: String },
}

/// Body of a staged batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedViolations {
    #[serde(default)]
    pub violation_resources: Vec<ViolationResource>,
}

pub trait ViolationSource: Send + Sync {
    fn pending_attributions(&self, tenant: &str, repo_full_name: &str)
        -> Result<PendingAttributions>;
}

/// On-disk file layouts accepted by [`FsViolationSource`].
#[derive(Deserialize)]
#[serde(untagged)]
enum ViolationsFile {
    List(Vec<ViolationResource>),
    #[serde(rename_all = "camelCase")]
    Staged { staged_key: String },
    Wrapped(StagedViolations),
}

/// Reads `<root>/<tenant>/<owner>/<name>.json`.
///
/// The file holds either a JSON array of violations, an object
/// `{"violationResources": [...]}`, or `{"stagedKey": "<blob key>"}` pointing
/// into the blob store. A missing file means nothing is pending.
#[derive(Debug, Clone)]
pub struct FsViolationSource {
    root: PathBuf,
}

impl FsViolationSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_for(&self, tenant: &str, repo_full_name: &str) -> PathBuf {
        let (owner, name) = repo_full_name
            .split_once('/')
            .unwrap_or(("", repo_full_name));
        let mut file = clone_dir(&self.root, tenant, owner, name).into_os_string();
        file.push(".json");
        PathBuf::from(file)
    }
}

impl ViolationSource for FsViolationSource {
    fn pending_attributions(
        &self,
        tenant: &str,
        repo_full_name: &str,
    ) -> Result<PendingAttributions> {
        let path = self.file_for(tenant, repo_full_name);
        if !path.exists() {
            debug!("No pending violations at {}", path.display());
            return Ok(PendingAttributions::Inline(Vec::new()));
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed: ViolationsFile = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid violations file {}", path.display()))?;

        Ok(match parsed {
            ViolationsFile::List(list) => PendingAttributions::Inline(list),
            ViolationsFile::Wrapped(body) => PendingAttributions::Inline(body.violation_resources),
            ViolationsFile::Staged { staged_key } => PendingAttributions::Staged { key: staged_key },
        })
    }
}

/// In-memory source keyed by `(tenant, owner/name)`.
#[derive(Debug, Clone, Default)]
pub struct MemoryViolationSource {
    pending: Arc<DashMap<(String, String), PendingAttributions>>,
}

impl MemoryViolationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: &str, repo_full_name: &str, pending: PendingAttributions) {
        self.pending
            .insert((tenant.to_string(), repo_full_name.to_string()), pending);
    }
}

impl ViolationSource for MemoryViolationSource {
    fn pending_attributions(
        &self,
        tenant: &str,
        repo_full_name: &str,
    ) -> Result<PendingAttributions> {
        Ok(self
            .pending
            .get(&(tenant.to_string(), repo_full_name.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or(PendingAttributions::Inline(Vec::new())))
    }
}
