//! Destinations for attribution results and repository statistics

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::VcsKind;
use crate::git::{CommitWindows, Contributor};
use crate::models::{AttributionUpdate, RepositoryRef};
use crate::storage::{expires_in_days, put_json, BlobStore};

/// Key prefix the downstream updater consumes.
pub const BLAME_QUEUE_PREFIX: &str = "updateViolationsResourcesBlameQueue";

/// Staged results are picked up well within a week.
pub const DEFAULT_RESULT_EXPIRY_DAYS: u32 = 7;

/// Receipt for one delivered chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    /// Where the chunk was staged
    pub key: String,
    pub count: usize,
}

/// Accepts chunks of attribution updates for one repository.
pub trait AttributionSink: Send + Sync {
    fn submit(
        &self,
        tenant: &str,
        repo_full_name: &str,
        updates: &[AttributionUpdate],
    ) -> Result<DeliveryAck>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedChunk<'a> {
    customer_name: &'a str,
    resources: &'a [AttributionUpdate],
}

/// Stages each chunk as its own blob under [`BLAME_QUEUE_PREFIX`].
#[derive(Clone)]
pub struct BlobQueueSink {
    store: Arc<dyn BlobStore>,
    expiry_days: u32,
}

impl BlobQueueSink {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            expiry_days: DEFAULT_RESULT_EXPIRY_DAYS,
        }
    }

    pub fn with_expiry_days(mut self, days: u32) -> Self {
        self.expiry_days = days;
        self
    }
}

impl AttributionSink for BlobQueueSink {
    fn submit(
        &self,
        tenant: &str,
        repo_full_name: &str,
        updates: &[AttributionUpdate],
    ) -> Result<DeliveryAck> {
        let key = format!("{}/{}", BLAME_QUEUE_PREFIX, Uuid::new_v4());
        let body = QueuedChunk {
            customer_name: tenant,
            resources: updates,
        };
        put_json(
            self.store.as_ref(),
            &key,
            &body,
            Some(expires_in_days(self.expiry_days)),
        )
        .with_context(|| format!("Failed to stage attributions for {}", repo_full_name))?;

        info!(
            "Staged {} attributions for {} at {}",
            updates.len(),
            repo_full_name,
            key
        );
        Ok(DeliveryAck {
            key,
            count: updates.len(),
        })
    }
}

/// Persists contributor and commit statistics of a repository.
pub trait RepositoryStatsSink: Send + Sync {
    fn save_contributors(
        &self,
        tenant: &str,
        kind: VcsKind,
        repository: &RepositoryRef,
        contributors: &[Contributor],
    ) -> Result<()>;

    fn save_commit_stats(
        &self,
        tenant: &str,
        kind: VcsKind,
        repository: &RepositoryRef,
        commits: &CommitWindows,
    ) -> Result<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContributorsBody<'a> {
    customer_name: &'a str,
    repository: String,
    #[serde(rename = "contributorsData")]
    contributors: &'a [Contributor],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitStatsBody<'a> {
    customer_name: &'a str,
    repository: String,
    #[serde(flatten)]
    commits: &'a CommitWindows,
}

/// Writes statistics to `repositoryStatistics/<tenant>/<source>/<owner>/<name>/`.
#[derive(Clone)]
pub struct BlobStatsSink {
    store: Arc<dyn BlobStore>,
}

impl BlobStatsSink {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn key(tenant: &str, kind: VcsKind, repository: &RepositoryRef, file: &str) -> String {
        format!(
            "repositoryStatistics/{}/{}/{}/{}/{}",
            tenant, kind, repository.owner, repository.name, file
        )
    }
}

impl RepositoryStatsSink for BlobStatsSink {
    fn save_contributors(
        &self,
        tenant: &str,
        kind: VcsKind,
        repository: &RepositoryRef,
        contributors: &[Contributor],
    ) -> Result<()> {
        let key = Self::key(tenant, kind, repository, "contributors.json");
        let body = ContributorsBody {
            customer_name: tenant,
            repository: repository.full_name(),
            contributors,
        };
        put_json(self.store.as_ref(), &key, &body, None)
            .with_context(|| format!("Failed to save contributors for {}", repository))?;
        debug!("Saved {} contributors to {}", contributors.len(), key);
        Ok(())
    }

    fn save_commit_stats(
        &self,
        tenant: &str,
        kind: VcsKind,
        repository: &RepositoryRef,
        commits: &CommitWindows,
    ) -> Result<()> {
        let key = Self::key(tenant, kind, repository, "commits.json");
        let body = CommitStatsBody {
            customer_name: tenant,
            repository: repository.full_name(),
            commits,
        };
        put_json(self.store.as_ref(), &key, &body, None)
            .with_context(|| format!("Failed to save commit stats for {}", repository))?;
        debug!("Saved commit stats to {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlameAttribution, ViolationResource};
    use crate::storage::MemoryBlobStore;
    use chrono::{TimeZone, Utc};

    fn update() -> AttributionUpdate {
        let resource = ViolationResource {
            violation_id: "v".into(),
            source_id: "s".into(),
            resource_id: "r".into(),
            ..Default::default()
        };
        let attribution = BlameAttribution {
            author: "Jane".into(),
            commit_hash: "abc123".into(),
            date: Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
        };
        AttributionUpdate::for_resource("acme", &resource, &attribution)
    }

    #[test]
    fn test_blob_queue_sink_stages_chunk() {
        let store = MemoryBlobStore::new();
        let sink = BlobQueueSink::new(Arc::new(store.clone()));

        let ack = sink.submit("acme", "acme/infra", &[update(), update()]).unwrap();
        assert_eq!(ack.count, 2);
        assert!(ack.key.starts_with("updateViolationsResourcesBlameQueue/"));
        assert!(store.expires_at(&ack.key).is_some());

        let body: serde_json::Value =
            serde_json::from_slice(&store.get(&ack.key).unwrap().unwrap()).unwrap();
        assert_eq!(body["customerName"], "acme");
        assert_eq!(body["resources"].as_array().unwrap().len(), 2);
        assert_eq!(body["resources"][0]["resourceId"], "v::s::r");
    }

    #[test]
    fn test_each_submit_gets_its_own_key() {
        let store = MemoryBlobStore::new();
        let sink = BlobQueueSink::new(Arc::new(store.clone()));
        sink.submit("acme", "acme/infra", &[update()]).unwrap();
        sink.submit("acme", "acme/infra", &[update()]).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_blob_stats_sink() {
        let store = MemoryBlobStore::new();
        let sink = BlobStatsSink::new(Arc::new(store.clone()));
        let repo = RepositoryRef::new("acme", "infra");

        sink.save_contributors(
            "acme",
            VcsKind::Github,
            &repo,
            &[Contributor {
                email: "jane@example.com".into(),
                username: "Jane".into(),
            }],
        )
        .unwrap();
        sink.save_commit_stats(
            "acme",
            VcsKind::Github,
            &repo,
            &CommitWindows {
                current_week_commits: 3,
                prev_week_commits: 1,
            },
        )
        .unwrap();

        let commits: serde_json::Value = serde_json::from_slice(
            &store
                .get("repositoryStatistics/acme/github/acme/infra/commits.json")
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(commits["currentWeekCommits"], 3);
        assert_eq!(commits["prevWeekCommits"], 1);
        assert_eq!(store.len(), 2);
    }
}
