//! Blame stage: two nested bounded pools over one clone
//!
//! The outer pool walks files, invoking git once per file. The inner pool
//! walks that file's resources, all sharing one [`BlameCache`]. Both pools
//! are bounded by semaphores and driven by `JoinSet`s on the caller's
//! runtime; git itself runs on the blocking pool.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cache::BlameCache;
use crate::git::{BlameError, BlameInvoker, BlameOutput, BlameParser, LineSelection};
use crate::models::{AttributionUpdate, ViolationResource};

/// A resource paired with the window it will be attributed on.
pub(crate) type ResolvedResource = (ViolationResource, LineSelection);

/// Aborts the stage after `limit` files in a row yield no attribution:
/// the invocation failed or every resource of the file was skipped.
/// `0` disables it.
#[derive(Debug)]
pub(crate) struct FailureGuard {
    limit: usize,
    consecutive: AtomicUsize,
    tripped: AtomicBool,
}

impl FailureGuard {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            consecutive: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub(crate) fn success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    pub(crate) fn failure(&self) {
        let count = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        if self.limit > 0 && count >= self.limit {
            self.tripped.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }
}

pub(crate) struct BlameStage {
    pub tenant: Arc<str>,
    pub repo_path: PathBuf,
    pub invoker: Arc<dyn BlameInvoker>,
    pub file_concurrency: usize,
    pub resource_concurrency: usize,
    pub guard: FailureGuard,
}

#[derive(Debug, Default)]
pub(crate) struct StageOutcome {
    pub updates: Vec<AttributionUpdate>,
    pub skipped: usize,
    pub blame_invocations: usize,
    pub cache_keys: BTreeMap<String, usize>,
    pub aborted: bool,
}

struct FileOutcome {
    file_path: String,
    updates: Vec<AttributionUpdate>,
    skipped: usize,
    invoked: bool,
    cache_keys: usize,
}

impl FileOutcome {
    fn skipped(file_path: String, skipped: usize, invoked: bool) -> Self {
        Self {
            file_path,
            updates: Vec::new(),
            skipped,
            invoked,
            cache_keys: 0,
        }
    }
}

impl BlameStage {
    pub(crate) async fn run(self, files: BTreeMap<String, Vec<ResolvedResource>>) -> StageOutcome {
        let stage = Arc::new(self);
        let file_slots = Arc::new(Semaphore::new(stage.file_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcome = StageOutcome::default();

        for (file_path, resources) in files {
            if stage.guard.is_tripped() {
                outcome.skipped += resources.len();
                continue;
            }
            let Ok(permit) = file_slots.clone().acquire_owned().await else {
                break;
            };
            let stage = stage.clone();
            tasks.spawn(async move {
                let _permit = permit;
                stage.process_file(file_path, resources).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(file) => {
                    outcome.skipped += file.skipped;
                    outcome.blame_invocations += usize::from(file.invoked);
                    if file.cache_keys > 0 {
                        outcome.cache_keys.insert(file.file_path, file.cache_keys);
                    }
                    outcome.updates.extend(file.updates);
                }
                Err(e) => error!("Blame task for {} panicked: {}", stage.repo_path.display(), e),
            }
        }

        outcome.aborted = stage.guard.is_tripped();
        outcome
    }

    async fn process_file(
        self: Arc<Self>,
        file_path: String,
        resources: Vec<ResolvedResource>,
    ) -> FileOutcome {
        if self.guard.is_tripped() {
            return FileOutcome::skipped(file_path, resources.len(), false);
        }

        let invoker = self.invoker.clone();
        let repo_path = self.repo_path.clone();
        let target = file_path.clone();
        let raw = match tokio::task::spawn_blocking(move || invoker.blame_file(&repo_path, &target))
            .await
        {
            Ok(result) => result,
            Err(e) => Err(BlameError::Invocation {
                file_path: file_path.clone(),
                message: e.to_string(),
            }),
        };

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "[{}] Skipping {} resources in {}: {} ({})",
                    self.tenant,
                    resources.len(),
                    file_path,
                    e,
                    e.code()
                );
                self.guard.failure();
                return FileOutcome::skipped(file_path, resources.len(), true);
            }
        };

        let output = Arc::new(BlameOutput::from_raw(file_path.clone(), &raw));
        let cache = BlameCache::new();
        let resource_slots = Arc::new(Semaphore::new(self.resource_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcome = FileOutcome::skipped(file_path, 0, true);

        for (resource, selection) in resources {
            let Ok(permit) = resource_slots.clone().acquire_owned().await else {
                break;
            };
            let stage = self.clone();
            let output = output.clone();
            let cache = cache.clone();
            tasks.spawn(async move {
                let _permit = permit;
                stage.attribute_resource(&output, &cache, &resource, selection)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(update)) => outcome.updates.push(update),
                Ok(None) => outcome.skipped += 1,
                Err(e) => {
                    error!("Attribution task in {} panicked: {}", outcome.file_path, e);
                    outcome.skipped += 1;
                }
            }
        }

        // One verdict per file: any attribution means the clone is readable
        if outcome.updates.is_empty() {
            self.guard.failure();
        } else {
            self.guard.success();
        }

        outcome.cache_keys = cache.len();
        let (hits, misses) = cache.stats();
        debug!(
            "{}: {} attributed, {} skipped, cache {} hits / {} misses",
            outcome.file_path,
            outcome.updates.len(),
            outcome.skipped,
            hits,
            misses
        );
        outcome
    }

    fn attribute_resource(
        &self,
        output: &BlameOutput,
        cache: &BlameCache,
        resource: &ViolationResource,
        selection: LineSelection,
    ) -> Option<AttributionUpdate> {
        match BlameParser::new(&self.tenant, output, cache).attribute(selection) {
            Ok(attribution) => Some(AttributionUpdate::for_resource(
                &self.tenant,
                resource,
                &attribution,
            )),
            Err(e) => {
                warn!(
                    "[{}] Skipping {} in {} lines {}: {} ({})",
                    self.tenant,
                    resource.key(),
                    output.file_path(),
                    selection,
                    e,
                    e.code()
                );
                None
            }
        }
    }
}
