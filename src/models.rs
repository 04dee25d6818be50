//! Core data models for blameline
//!
//! These models describe the violations handed to us by the upstream scanner
//! and the attribution updates we stage for the downstream consumer. Field
//! names on the wire follow the violations service payloads (camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Repository identity as configured for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    /// Branch to check out (snapshot clones only)
    #[serde(default)]
    pub branch: Option<String>,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Parse `owner/name` or `owner/name@branch`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (repo, branch) = match s.split_once('@') {
            Some((repo, branch)) if !branch.is_empty() => (repo, Some(branch.to_string())),
            Some(_) => return Err(format!("'{}' has an empty branch after '@'", s)),
            None => (s, None),
        };
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in owner/name form", s))?;
        if owner.is_empty() || name.is_empty() {
            return Err(format!("'{}' is not in owner/name form", s));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            branch,
        })
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Location of a violating resource inside the scanned snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLocation {
    /// File key within the snapshot, possibly with a leading `/`
    #[serde(rename = "s3FileKey", default)]
    pub file_path: Option<String>,
    /// Declared `[start, end]` span of the resource
    #[serde(default)]
    pub metadata_lines: Option<Vec<u32>>,
}

/// A previously detected policy violation tied to a location in source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationResource {
    pub violation_id: String,
    pub source_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource: ResourceLocation,
    /// Exact erroneous lines, a refinement of `metadata_lines`
    #[serde(default)]
    pub error_lines: Option<Vec<u32>>,
    /// Existing blame record to update instead of creating a new one
    #[serde(rename = "gitBlameMetadataId", default)]
    pub existing_blame_metadata_id: Option<String>,
}

impl ViolationResource {
    /// Composite identity `violationId::sourceId::resourceId`.
    pub fn key(&self) -> String {
        format!(
            "{}::{}::{}",
            self.violation_id, self.source_id, self.resource_id
        )
    }

    pub fn file_path(&self) -> Option<&str> {
        self.resource.file_path.as_deref().filter(|p| !p.is_empty())
    }

    /// File path with a leading `/` removed, used as the grouping key.
    pub fn normalized_file_path(&self) -> Option<&str> {
        self.file_path().map(|p| p.strip_prefix('/').unwrap_or(p))
    }

    pub fn metadata_lines(&self) -> &[u32] {
        self.resource.metadata_lines.as_deref().unwrap_or(&[])
    }

    pub fn error_lines(&self) -> &[u32] {
        self.error_lines.as_deref().unwrap_or(&[])
    }

    /// True when the resource carries some line data to attribute.
    pub fn has_line_data(&self) -> bool {
        !self.error_lines().is_empty() || !self.metadata_lines().is_empty()
    }
}

/// Who last touched a violating line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlameAttribution {
    pub author: String,
    pub commit_hash: String,
    pub date: DateTime<Utc>,
}

/// Attribution metadata as stored downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitBlameMetadata {
    pub customer_name: String,
    pub author: String,
    pub commit_hash: String,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_blame_metadata_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedData {
    pub git_blame_metadata: GitBlameMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_blame_metadata_id: Option<String>,
}

/// One staged update: attach `git_blame_metadata` to the resource `resource_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionUpdate {
    /// Composite `violationId::sourceId::resourceId`
    pub resource_id: String,
    pub updated_data: UpdatedData,
}

impl AttributionUpdate {
    /// Build the update for `resource`. When the resource already references a
    /// blame record the update targets it; otherwise downstream creates one.
    pub fn for_resource(
        tenant: &str,
        resource: &ViolationResource,
        attribution: &BlameAttribution,
    ) -> Self {
        let existing = resource.existing_blame_metadata_id.clone();
        Self {
            resource_id: resource.key(),
            updated_data: UpdatedData {
                git_blame_metadata: GitBlameMetadata {
                    customer_name: tenant.to_string(),
                    author: attribution.author.clone(),
                    commit_hash: attribution.commit_hash.clone(),
                    date: attribution.date,
                    git_blame_metadata_id: existing.clone(),
                },
                git_blame_metadata_id: existing,
            },
        }
    }

    pub fn is_update_in_place(&self) -> bool {
        self.updated_data.git_blame_metadata_id.is_some()
    }

    pub fn attribution(&self) -> BlameAttribution {
        let meta = &self.updated_data.git_blame_metadata;
        BlameAttribution {
            author: meta.author.clone(),
            commit_hash: meta.commit_hash.clone(),
            date: meta.date,
        }
    }
}
