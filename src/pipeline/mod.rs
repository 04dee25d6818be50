//! Attribution pipeline
//!
//! Drives one run for one tenant and one VCS source:
//! 1. Resolve clone URLs for every repository (a failure aborts the run)
//! 2. Per repository: fetch pending violations, filter and group them by file
//! 3. Bare clone, then blame every file under bounded concurrency
//! 4. Deliver the attributions in chunks and drop the clone
//!
//! A repository that fails is reported and the run moves on to the next one.

mod blame_stage;
mod report;

pub use report::{PipelineSummary, RepositoryReport, RepositoryStatus};

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::git::{
    resolve_resource, BlameInvoker, CloneManager, CloneMode, CloneUrl, GitBlameInvoker,
    LineSelection,
};
use crate::models::{AttributionUpdate, RepositoryRef, ViolationResource};
use crate::storage::{get_json, BlobStore};
use crate::vcs::{
    AttributionSink, CloneUrlRequest, CloneUrlResolver, PendingAttributions, StagedViolations,
    VcsKind, ViolationSource,
};
use blame_stage::{BlameStage, FailureGuard};

pub const DEFAULT_FILE_CONCURRENCY: usize = 250;
pub const DEFAULT_RESOURCE_CONCURRENCY: usize = 100;
pub const DEFAULT_CHUNK_SIZE: usize = 5000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 50;
pub const EXTERNAL_MODULES_SEGMENT: &str = ".external_modules";

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to resolve clone URL for {repository}: {source}")]
    CloneUrlResolution {
        repository: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to set up the blame runtime: {0}")]
    Setup(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Files blamed at once
    pub file_concurrency: usize,
    /// Resources attributed at once within one file
    pub resource_concurrency: usize,
    /// Attribution updates per delivered chunk
    pub chunk_size: usize,
    /// Unit failures in a row before a repository is abandoned (0 = never)
    pub max_consecutive_failures: usize,
    /// Path segments whose files are never attributed
    pub excluded_path_segments: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            file_concurrency: DEFAULT_FILE_CONCURRENCY,
            resource_concurrency: DEFAULT_RESOURCE_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            excluded_path_segments: vec![EXTERNAL_MODULES_SEGMENT.to_string()],
        }
    }
}

/// Violations of one repository grouped by normalized file path.
#[derive(Debug, Default)]
pub struct GroupedViolations {
    pub files: BTreeMap<String, Vec<(ViolationResource, LineSelection)>>,
    /// No path, no line data, or under an excluded segment
    pub filtered: usize,
    /// Declared lines and error lines do not overlap
    pub unattributable: usize,
}

impl GroupedViolations {
    pub fn resources(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

fn is_excluded_path(path: &str, excluded_segments: &[String]) -> bool {
    path.split('/')
        .any(|segment| excluded_segments.iter().any(|excluded| excluded == segment))
}

/// Filter violations and group the attributable ones by file.
pub fn group_by_file(
    resources: Vec<ViolationResource>,
    excluded_segments: &[String],
) -> GroupedViolations {
    let mut grouped = GroupedViolations::default();

    for resource in resources {
        let Some(path) = resource.normalized_file_path().map(str::to_string) else {
            debug!("{} has no file path", resource.key());
            grouped.filtered += 1;
            continue;
        };
        if is_excluded_path(&path, excluded_segments) {
            debug!("{} is under an excluded path, skipped", path);
            grouped.filtered += 1;
            continue;
        }
        if !resource.has_line_data() {
            debug!("{} has neither error lines nor metadata lines", resource.key());
            grouped.filtered += 1;
            continue;
        }
        match resolve_resource(&resource) {
            Some(selection) => grouped
                .files
                .entry(path)
                .or_default()
                .push((resource, selection)),
            None => {
                warn!(
                    "{} in {}: no error line within metadata lines {:?}, skipped",
                    resource.key(),
                    path,
                    resource.metadata_lines()
                );
                grouped.unattributable += 1;
            }
        }
    }

    grouped
}

pub struct AttributionPipeline {
    config: PipelineConfig,
    clones: CloneManager,
    urls: Arc<dyn CloneUrlResolver>,
    violations: Arc<dyn ViolationSource>,
    blobs: Arc<dyn BlobStore>,
    sink: Arc<dyn AttributionSink>,
    invoker: Arc<dyn BlameInvoker>,
}

impl AttributionPipeline {
    pub fn new(
        config: PipelineConfig,
        clones: CloneManager,
        urls: Arc<dyn CloneUrlResolver>,
        violations: Arc<dyn ViolationSource>,
        blobs: Arc<dyn BlobStore>,
        sink: Arc<dyn AttributionSink>,
    ) -> Self {
        Self {
            config,
            clones,
            urls,
            violations,
            blobs,
            sink,
            invoker: Arc::new(GitBlameInvoker),
        }
    }

    /// Replace the `git blame` invoker.
    pub fn with_invoker(mut self, invoker: Arc<dyn BlameInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Attribute pending violations for every repository in `repositories`.
    pub fn run(
        &self,
        tenant: &str,
        kind: VcsKind,
        repositories: &[RepositoryRef],
    ) -> Result<PipelineSummary, PipelineError> {
        info!(
            "Attribution run for {} ({}): {} repositories",
            tenant,
            kind,
            repositories.len()
        );

        let mut targets = Vec::with_capacity(repositories.len());
        for repository in repositories {
            if self.clones.is_excluded(repository) {
                targets.push((repository, None));
                continue;
            }
            let request = CloneUrlRequest {
                tenant: tenant.to_string(),
                kind,
                owner: repository.owner.clone(),
                name: repository.name.clone(),
            };
            let url = self
                .urls
                .resolve(&request)
                .map_err(|source| PipelineError::CloneUrlResolution {
                    repository: repository.full_name(),
                    source,
                })?;
            targets.push((repository, Some(url)));
        }

        let runtime = tokio::runtime::Builder::new_current_thread().build()?;

        let mut summary = PipelineSummary {
            tenant: tenant.to_string(),
            kind,
            repositories: Vec::with_capacity(targets.len()),
        };
        for (repository, url) in targets {
            let report = match url {
                Some(url) => self.process_repository(&runtime, tenant, repository, &url),
                None => {
                    info!("{} is on the exclusion list, skipped", repository);
                    RepositoryReport::skipped(repository)
                }
            };
            info!("{}: {}", repository, report.status);
            summary.repositories.push(report);
        }

        info!(
            "Attribution run for {} done: {} attributed, {} skipped",
            tenant,
            summary.attributed(),
            summary.skipped()
        );
        Ok(summary)
    }

    fn pending_violations(
        &self,
        tenant: &str,
        repository: &RepositoryRef,
    ) -> anyhow::Result<Vec<ViolationResource>> {
        match self
            .violations
            .pending_attributions(tenant, &repository.full_name())?
        {
            PendingAttributions::Inline(resources) => Ok(resources),
            PendingAttributions::Staged { key } => {
                debug!("Reading staged violations for {} from {}", repository, key);
                let staged: StagedViolations = get_json(self.blobs.as_ref(), &key)?
                    .ok_or_else(|| anyhow::anyhow!("staged violations '{}' not found", key))?;
                Ok(staged.violation_resources)
            }
        }
    }

    fn process_repository(
        &self,
        runtime: &Runtime,
        tenant: &str,
        repository: &RepositoryRef,
        url: &CloneUrl,
    ) -> RepositoryReport {
        let mut report = RepositoryReport::new(repository);

        let resources = match self.pending_violations(tenant, repository) {
            Ok(resources) => resources,
            Err(e) => {
                warn!("Failed to fetch violations for {}: {:#}", repository, e);
                report.fail(format!("violation source: {:#}", e));
                return report;
            }
        };
        report.pending = resources.len();
        if resources.is_empty() {
            info!("{} has no violations pending attribution", repository);
            return report;
        }

        let grouped = group_by_file(resources, &self.config.excluded_path_segments);
        report.filtered = grouped.filtered;
        report.skipped = grouped.unattributable;
        report.files = grouped.files.len();
        if grouped.files.is_empty() {
            info!("{} has no attributable violations", repository);
            return report;
        }

        let clone = match self
            .clones
            .clone_repository(tenant, repository, url, &CloneMode::Bare)
        {
            Ok(clone) => clone,
            Err(e) => {
                warn!("{}", e);
                report.fail(e.to_string());
                return report;
            }
        };
        report.clone_size_mb = Some(clone.size_on_disk_mb());

        info!(
            "Blaming {} resources in {} files of {}",
            grouped.resources(),
            grouped.files.len(),
            repository
        );
        let stage = BlameStage {
            tenant: Arc::from(tenant),
            repo_path: clone.path().to_path_buf(),
            invoker: self.invoker.clone(),
            file_concurrency: self.config.file_concurrency,
            resource_concurrency: self.config.resource_concurrency,
            guard: FailureGuard::new(self.config.max_consecutive_failures),
        };
        let outcome = runtime.block_on(stage.run(grouped.files));
        drop(clone);

        report.skipped += outcome.skipped;
        report.blame_invocations = outcome.blame_invocations;
        report.cache_keys = outcome.cache_keys;

        if outcome.aborted {
            warn!(
                "{}: {} consecutive failures, abandoning repository",
                repository, self.config.max_consecutive_failures
            );
            report.fail("consecutive failures");
            return report;
        }

        report.attributed = outcome.updates.len();
        self.deliver(tenant, repository, &outcome.updates, &mut report);
        report
    }

    fn deliver(
        &self,
        tenant: &str,
        repository: &RepositoryRef,
        updates: &[AttributionUpdate],
        report: &mut RepositoryReport,
    ) {
        if updates.is_empty() {
            return;
        }

        let full_name = repository.full_name();
        for chunk in updates.chunks(self.config.chunk_size.max(1)) {
            match self.sink.submit(tenant, &full_name, chunk) {
                Ok(ack) => {
                    debug!("Delivered {} updates as {}", ack.count, ack.key);
                    report.chunks_delivered += 1;
                }
                Err(e) => {
                    warn!("Failed to deliver a chunk for {}: {:#}", repository, e);
                    report.chunks_failed += 1;
                }
            }
        }

        if report.chunks_failed > 0 {
            report.fail(format!(
                "{} of {} chunks failed to deliver",
                report.chunks_failed,
                report.chunks_failed + report.chunks_delivered
            ));
        }
    }
}
