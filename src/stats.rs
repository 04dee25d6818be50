//! Repository statistics clones and the clone result log
//!
//! A statistics run fully clones each repository, reads its recent history
//! and hands contributors and weekly commit counts to a
//! [`RepositoryStatsSink`]. Every attempt yields a [`CloneResult`]; the
//! [`CloneResultLog`] keeps per-scan lists of failed and successful clones.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::git::clone::{bytes_to_mb, directory_size_bytes};
use crate::git::{collect_activity, CloneManager, CloneMode, DEFAULT_LOG_SINCE};
use crate::models::RepositoryRef;
use crate::storage::{expires_in_days, get_json, put_json, BlobStore};
use crate::vcs::{
    CloneUrlRequest, CloneUrlResolver, RepositoryStatsSink, VcsKind, DEFAULT_RESULT_EXPIRY_DAYS,
};

/// Outcome of one statistics clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneResult {
    pub repository_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(rename = "cloneSize", default, skip_serializing_if = "Option::is_none")]
    pub clone_size_mb: Option<f64>,
    #[serde(rename = "cloneDuration", default, skip_serializing_if = "Option::is_none")]
    pub clone_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CloneResult {
    fn new(repository: &RepositoryRef, repository_id: Option<&str>) -> Self {
        Self {
            repository_name: repository.full_name(),
            repository_id: repository_id.map(str::to_string),
            clone_size_mb: None,
            clone_duration_ms: None,
            error: None,
        }
    }

    fn failed(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_successful(&self) -> bool {
        self.error.is_none() && self.clone_size_mb.is_some()
    }
}

/// Clones repositories to collect contributor and commit statistics.
pub struct StatsCollector {
    clones: CloneManager,
    urls: Arc<dyn CloneUrlResolver>,
    sink: Arc<dyn RepositoryStatsSink>,
    log_since: String,
}

impl StatsCollector {
    pub fn new(
        clones: CloneManager,
        urls: Arc<dyn CloneUrlResolver>,
        sink: Arc<dyn RepositoryStatsSink>,
    ) -> Self {
        Self {
            clones,
            urls,
            sink,
            log_since: DEFAULT_LOG_SINCE.to_string(),
        }
    }

    /// `git log --since` window, e.g. `90.days`
    pub fn with_log_since(mut self, since: impl Into<String>) -> Self {
        self.log_since = since.into();
        self
    }

    /// Fully clone `repository`, save its statistics and report how it went.
    /// Never fails: errors end up in [`CloneResult::error`].
    pub fn clone_repository_stats(
        &self,
        tenant: &str,
        kind: VcsKind,
        repository: &RepositoryRef,
        repository_id: Option<&str>,
    ) -> CloneResult {
        let result = CloneResult::new(repository, repository_id);
        if self.clones.is_excluded(repository) {
            info!("{} is on the exclusion list, not cloned", repository);
            return result.failed("repository is on the exclusion list");
        }

        let request = CloneUrlRequest {
            tenant: tenant.to_string(),
            kind,
            owner: repository.owner.clone(),
            name: repository.name.clone(),
        };
        let url = match self.urls.resolve(&request) {
            Ok(url) => url,
            Err(e) => {
                info!("No clone URL for {}, skipped: {:#}", repository, e);
                return result.failed(format!("clone URL: {:#}", e));
            }
        };

        debug!(
            "Clone root holds {:.2} MB before cloning {}",
            bytes_to_mb(directory_size_bytes(self.clones.root())),
            repository
        );
        let started = Instant::now();
        let outcome = self
            .clones
            .clone_repository(tenant, repository, &url, &CloneMode::Full)
            .map_err(anyhow::Error::from)
            .and_then(|clone| {
                let size = clone.size_on_disk_mb();
                let duration = started.elapsed().as_millis() as u64;
                debug!(
                    "Clone root holds {:.2} MB after cloning {}",
                    bytes_to_mb(directory_size_bytes(self.clones.root())),
                    repository
                );
                self.save_statistics(tenant, kind, repository, &clone)?;
                Ok((size, duration))
            });
        debug!(
            "Clone root holds {:.2} MB after cleaning up {}",
            bytes_to_mb(directory_size_bytes(self.clones.root())),
            repository
        );

        match outcome {
            Ok((size, duration)) => {
                info!(
                    "Collected statistics for {} ({:.2} MB in {}ms)",
                    repository, size, duration
                );
                CloneResult {
                    clone_size_mb: Some(size),
                    clone_duration_ms: Some(duration),
                    ..result
                }
            }
            Err(e) => {
                error!("Statistics clone of {} failed: {:#}", repository, e);
                result.failed(format!("{:#}", e))
            }
        }
    }

    fn save_statistics(
        &self,
        tenant: &str,
        kind: VcsKind,
        repository: &RepositoryRef,
        clone: &crate::git::ClonedRepository,
    ) -> Result<()> {
        let activity = collect_activity(clone.path(), &self.log_since)
            .with_context(|| format!("Failed to read history of {}", repository))?;
        self.sink
            .save_contributors(tenant, kind, repository, &activity.contributors)?;
        self.sink
            .save_commit_stats(tenant, kind, repository, &activity.commits)?;
        Ok(())
    }
}

/// Failed clones recorded for one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneErrors {
    pub failed_repositories: Vec<CloneResult>,
    pub failed_repositories_count: usize,
}

/// Per-scan clone logs in the blob store.
///
/// Keys: `clones/<tenant>/<scan millis>[/<source>]/failedClones/failed_repos_clone.json`
/// and `.../statistics/clone_details.json`.
#[derive(Clone)]
pub struct CloneResultLog {
    store: Arc<dyn BlobStore>,
    expiry_days: u32,
}

impl CloneResultLog {
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

    fn scan_prefix(tenant: &str, execution_time: DateTime<Utc>, source: Option<VcsKind>) -> String {
        let mut prefix = format!("clones/{}/{}", tenant, execution_time.timestamp_millis());
        if let Some(source) = source {
            prefix.push('/');
            prefix.push_str(source.as_str());
        }
        prefix
    }

    pub fn failed_key(tenant: &str, execution_time: DateTime<Utc>, source: Option<VcsKind>) -> String {
        format!(
            "{}/failedClones/failed_repos_clone.json",
            Self::scan_prefix(tenant, execution_time, source)
        )
    }

    pub fn details_key(tenant: &str, execution_time: DateTime<Utc>, source: Option<VcsKind>) -> String {
        format!(
            "{}/statistics/clone_details.json",
            Self::scan_prefix(tenant, execution_time, source)
        )
    }

    fn read(&self, key: &str) -> Result<Vec<CloneResult>> {
        Ok(get_json(self.store.as_ref(), key)
            .with_context(|| format!("Failed to read clone log {}", key))?
            .unwrap_or_default())
    }

    fn upsert(&self, key: &str, new_results: Vec<CloneResult>) -> Result<()> {
        if new_results.is_empty() {
            return Ok(());
        }
        let mut results = self.read(key)?;
        results.extend(new_results);
        put_json(
            self.store.as_ref(),
            key,
            &results,
            Some(expires_in_days(self.expiry_days)),
        )
        .with_context(|| format!("Failed to write clone log {}", key))
    }

    /// Append failed and successful results to the scan's logs.
    pub fn append(
        &self,
        tenant: &str,
        execution_time: DateTime<Utc>,
        source: Option<VcsKind>,
        results: &[CloneResult],
    ) -> Result<()> {
        let failed: Vec<CloneResult> = results.iter().filter(|r| r.is_failed()).cloned().collect();
        let successful: Vec<CloneResult> = results
            .iter()
            .filter(|r| r.is_successful())
            .cloned()
            .collect();
        info!(
            "Recording {} failed and {} successful clones for {}",
            failed.len(),
            successful.len(),
            tenant
        );

        self.upsert(&Self::failed_key(tenant, execution_time, source), failed)?;
        self.upsert(&Self::details_key(tenant, execution_time, source), successful)?;
        Ok(())
    }

    /// Failed clones of a scan. A scan without a log has none.
    pub fn clone_errors_for_scan(
        &self,
        tenant: &str,
        execution_time: DateTime<Utc>,
        source: Option<VcsKind>,
    ) -> Result<CloneErrors> {
        let failed_repositories = self.read(&Self::failed_key(tenant, execution_time, source))?;
        Ok(CloneErrors {
            failed_repositories_count: failed_repositories.len(),
            failed_repositories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::CloneUrl;
    use crate::storage::MemoryBlobStore;
    use crate::vcs::{BlobStatsSink, StaticCloneUrls};
    use chrono::TimeZone;
    use git2::{Repository, Signature, Time};
    use std::path::Path;
    use tempfile::tempdir;

    fn scan_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn ok(name: &str) -> CloneResult {
        CloneResult {
            repository_name: name.into(),
            repository_id: None,
            clone_size_mb: Some(1.5),
            clone_duration_ms: Some(20),
            error: None,
        }
    }

    fn failed(name: &str) -> CloneResult {
        CloneResult {
            repository_name: name.into(),
            repository_id: Some("42".into()),
            clone_size_mb: None,
            clone_duration_ms: None,
            error: Some("fatal: repository not found".into()),
        }
    }

    #[test]
    fn test_log_keys() {
        assert_eq!(
            CloneResultLog::failed_key("acme", scan_time(), Some(VcsKind::Gitlab)),
            "clones/acme/1709287200000/gitlab/failedClones/failed_repos_clone.json"
        );
        assert_eq!(
            CloneResultLog::details_key("acme", scan_time(), None),
            "clones/acme/1709287200000/statistics/clone_details.json"
        );
    }

    #[test]
    fn test_append_accumulates_and_reads_back() {
        let store = MemoryBlobStore::new();
        let log = CloneResultLog::new(Arc::new(store.clone()));

        log.append("acme", scan_time(), None, &[ok("a/one"), failed("a/two")])
            .unwrap();
        log.append("acme", scan_time(), None, &[failed("a/three")])
            .unwrap();

        let errors = log.clone_errors_for_scan("acme", scan_time(), None).unwrap();
        assert_eq!(errors.failed_repositories_count, 2);
        assert_eq!(errors.failed_repositories[0].repository_name, "a/two");
        assert_eq!(errors.failed_repositories[1].repository_name, "a/three");

        let details_key = CloneResultLog::details_key("acme", scan_time(), None);
        assert!(store.expires_at(&details_key).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_clone_errors_for_unknown_scan_is_empty() {
        let log = CloneResultLog::new(Arc::new(MemoryBlobStore::new()));
        let errors = log
            .clone_errors_for_scan("acme", scan_time(), Some(VcsKind::Github))
            .unwrap();
        assert_eq!(errors, CloneErrors::default());
    }

    #[test]
    fn test_clone_result_wire_format() {
        let json = serde_json::to_value(ok("acme/infra")).unwrap();
        assert_eq!(json["repositoryName"], "acme/infra");
        assert_eq!(json["cloneSize"], 1.5);
        assert_eq!(json["cloneDuration"], 20);
        assert!(json.get("error").is_none());
    }

    fn create_recent_repo(dir: &Path) -> anyhow::Result<()> {
        let repo = Repository::init(dir)?;
        let when = Utc::now().timestamp() - 86_400;
        let sig = Signature::new("Jane Doe", "jane@example.com", &Time::new(when, 0))?;
        std::fs::write(dir.join("main.tf"), "a\n")?;
        let mut index = repo.index()?;
        index.add_path(Path::new("main.tf"))?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])?;
        Ok(())
    }

    #[test]
    fn test_clone_repository_stats_saves_activity() -> anyhow::Result<()> {
        let source = tempdir()?;
        create_recent_repo(source.path())?;
        let root = tempdir()?;
        let store = MemoryBlobStore::new();
        let urls = StaticCloneUrls::new().with(
            "acme/infra",
            CloneUrl::new(format!("file://{}", source.path().display())),
        );
        let collector = StatsCollector::new(
            CloneManager::new(root.path()),
            Arc::new(urls),
            Arc::new(BlobStatsSink::new(Arc::new(store.clone()))),
        );

        let repo = RepositoryRef::new("acme", "infra");
        let result = collector.clone_repository_stats("acme", VcsKind::Github, &repo, Some("7"));
        assert!(result.is_successful(), "{:?}", result.error);
        assert_eq!(result.repository_id.as_deref(), Some("7"));
        // Measured while the clone still existed
        assert!(result.clone_size_mb.unwrap_or_default() > 0.0);

        let key = BlobStatsSink::key("acme", VcsKind::Github, &repo, "commits.json");
        let commits: serde_json::Value = serde_json::from_slice(&store.get(&key)?.unwrap())?;
        assert_eq!(commits["currentWeekCommits"], 1);
        assert!(!CloneManager::new(root.path()).clone_dir("acme", &repo).exists());
        Ok(())
    }

    #[test]
    fn test_clone_repository_stats_reports_failures() {
        let root = tempdir().unwrap();
        let collector = StatsCollector::new(
            CloneManager::new(root.path()).with_exclusions(["acme/huge"]),
            Arc::new(StaticCloneUrls::new().with(
                "acme/gone",
                CloneUrl::new("file:///nonexistent/blameline/repo"),
            )),
            Arc::new(BlobStatsSink::new(Arc::new(MemoryBlobStore::new()))),
        );

        for name in ["huge", "gone", "unknown"] {
            let result = collector.clone_repository_stats(
                "acme",
                VcsKind::Github,
                &RepositoryRef::new("acme", name),
                None,
            );
            assert!(result.is_failed(), "{} should fail", name);
        }
    }
}
