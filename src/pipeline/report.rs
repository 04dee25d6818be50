//! Run summaries

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::RepositoryRef;
use crate::vcs::VcsKind;

/// Final state of one repository in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RepositoryStatus {
    Done,
    /// On the exclusion list; never cloned.
    Skipped,
    Failed { reason: String },
}

impl RepositoryStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, RepositoryStatus::Failed { .. })
    }
}

impl fmt::Display for RepositoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryStatus::Done => write!(f, "done"),
            RepositoryStatus::Skipped => write!(f, "skipped"),
            RepositoryStatus::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// What happened to one repository.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryReport {
    pub repository: String,
    #[serde(flatten)]
    pub status: RepositoryStatus,
    /// Violations handed over by the source
    pub pending: usize,
    /// Dropped before processing: no path, no line data, or excluded path
    pub filtered: usize,
    pub attributed: usize,
    /// Unattributable windows and per-file or per-resource blame failures
    pub skipped: usize,
    pub files: usize,
    pub blame_invocations: usize,
    /// Distinct cache keys per file
    pub cache_keys: BTreeMap<String, usize>,
    pub chunks_delivered: usize,
    pub chunks_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_size_mb: Option<f64>,
}

impl RepositoryReport {
    pub fn new(repository: &RepositoryRef) -> Self {
        Self {
            repository: repository.full_name(),
            status: RepositoryStatus::Done,
            pending: 0,
            filtered: 0,
            attributed: 0,
            skipped: 0,
            files: 0,
            blame_invocations: 0,
            cache_keys: BTreeMap::new(),
            chunks_delivered: 0,
            chunks_failed: 0,
            clone_size_mb: None,
        }
    }

    pub fn skipped(repository: &RepositoryRef) -> Self {
        Self {
            status: RepositoryStatus::Skipped,
            ..Self::new(repository)
        }
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.status = RepositoryStatus::Failed {
            reason: reason.into(),
        };
    }

    pub fn distinct_cache_keys(&self) -> usize {
        self.cache_keys.values().sum()
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub tenant: String,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: VcsKind,
    pub repositories: Vec<RepositoryReport>,
}

fn serialize_kind<S: serde::Serializer>(kind: &VcsKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

impl PipelineSummary {
    pub fn has_failures(&self) -> bool {
        self.repositories.iter().any(|r| r.status.is_failed())
    }

    pub fn attributed(&self) -> usize {
        self.repositories.iter().map(|r| r.attributed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.repositories.iter().map(|r| r.skipped).sum()
    }

    pub fn report(&self, full_name: &str) -> Option<&RepositoryReport> {
        self.repositories.iter().find(|r| r.repository == full_name)
    }
}
