//! End-to-end attribution runs against fixture repositories cloned over file://

use anyhow::Result;
use blameline::git::{BlameError, BlameInvoker, CloneManager, CloneUrl, GitBlameInvoker};
use blameline::models::{AttributionUpdate, RepositoryRef, ResourceLocation, ViolationResource};
use blameline::pipeline::{
    AttributionPipeline, PipelineConfig, PipelineError, PipelineSummary, RepositoryStatus,
};
use blameline::storage::{put_json, BlobStore, MemoryBlobStore};
use blameline::vcs::{
    AttributionSink, BlobQueueSink, DeliveryAck, MemoryViolationSource, PendingAttributions,
    StagedViolations, StaticCloneUrls, VcsKind,
};
use git2::{Repository, Signature, Time};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const TENANT: &str = "acme";
const JANE_TIME: i64 = 1_700_000_000;
const BOB_TIME: i64 = 1_700_100_000;

/// `main.tf`: five lines by Jane, then line 4 rewritten by Bob.
/// `vars.tf`: three lines by Jane.
struct Fixture {
    _dir: TempDir,
    url: CloneUrl,
    jane_commit: String,
    bob_commit: String,
}

fn commit_all(repo: &Repository, sig: &Signature, message: &str, files: &[&str]) -> Result<git2::Oid> {
    let mut index = repo.index()?;
    for file in files {
        index.add_path(Path::new(file))?;
    }
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit()?],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    Ok(repo.commit(Some("HEAD"), sig, sig, message, &tree, &parent_refs)?)
}

fn fixture() -> Result<Fixture> {
    let dir = tempdir()?;
    let repo = Repository::init(dir.path())?;

    let jane = Signature::new("Jane Doe", "jane@example.com", &Time::new(JANE_TIME, 0))?;
    std::fs::write(
        dir.path().join("main.tf"),
        "resource \"aws_s3_bucket\" \"logs\" {\n  bucket = \"logs\"\n  versioning = false\n  acl = \"private\"\n}\n",
    )?;
    std::fs::write(dir.path().join("vars.tf"), "variable \"a\" {}\nvariable \"b\" {}\nvariable \"c\" {}\n")?;
    let jane_commit = commit_all(&repo, &jane, "initial", &["main.tf", "vars.tf"])?;

    let bob = Signature::new("Bob Stone", "bob@example.com", &Time::new(BOB_TIME, 0))?;
    std::fs::write(
        dir.path().join("main.tf"),
        "resource \"aws_s3_bucket\" \"logs\" {\n  bucket = \"logs\"\n  versioning = false\n  acl = \"public-read\"\n}\n",
    )?;
    let bob_commit = commit_all(&repo, &bob, "open it up", &["main.tf"])?;

    let url = CloneUrl::new(format!("file://{}", dir.path().display()));
    Ok(Fixture {
        _dir: dir,
        url,
        jane_commit: jane_commit.to_string(),
        bob_commit: bob_commit.to_string(),
    })
}

fn violation(
    id: &str,
    path: &str,
    metadata_lines: Vec<u32>,
    error_lines: Option<Vec<u32>>,
) -> ViolationResource {
    ViolationResource {
        violation_id: format!("v{}", id),
        source_id: "src".into(),
        resource_id: format!("r{}", id),
        resource: ResourceLocation {
            file_path: Some(path.to_string()),
            metadata_lines: Some(metadata_lines),
        },
        error_lines,
        existing_blame_metadata_id: None,
    }
}

/// Three resources in `main.tf` (two share a window), one unattributable in `vars.tf`.
fn scenario_violations() -> Vec<ViolationResource> {
    vec![
        violation("1", "/main.tf", vec![1, 3], None),
        violation("2", "main.tf", vec![1, 3], Some(vec![])),
        violation("3", "/main.tf", vec![1, 5], Some(vec![4])),
        violation("4", "vars.tf", vec![10, 12], Some(vec![2])),
    ]
}

/// Counts invocations per file before delegating to git.
#[derive(Default)]
struct CountingInvoker {
    calls: Mutex<Vec<String>>,
}

impl CountingInvoker {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl BlameInvoker for CountingInvoker {
    fn blame_file(&self, repo_path: &Path, file_path: &str) -> Result<String, BlameError> {
        self.calls.lock().unwrap().push(file_path.to_string());
        GitBlameInvoker.blame_file(repo_path, file_path)
    }
}

struct FailingInvoker;

impl BlameInvoker for FailingInvoker {
    fn blame_file(&self, _repo_path: &Path, file_path: &str) -> Result<String, BlameError> {
        Err(BlameError::Invocation {
            file_path: file_path.to_string(),
            message: "fatal: no such path in HEAD".into(),
        })
    }
}

/// Rejects the first `failures` submissions, accepts the rest.
struct FlakySink {
    failures: usize,
    calls: AtomicUsize,
    accepted: Mutex<Vec<usize>>,
}

impl AttributionSink for FlakySink {
    fn submit(
        &self,
        _tenant: &str,
        _repo_full_name: &str,
        updates: &[AttributionUpdate],
    ) -> Result<DeliveryAck> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("queue unavailable");
        }
        self.accepted.lock().unwrap().push(updates.len());
        Ok(DeliveryAck {
            key: format!("chunk-{}", call),
            count: updates.len(),
        })
    }
}

struct Harness {
    clone_root: TempDir,
    store: MemoryBlobStore,
    violations: MemoryViolationSource,
    urls: StaticCloneUrls,
    config: PipelineConfig,
    excluded: Vec<String>,
}

impl Harness {
    fn new() -> Result<Self> {
        Ok(Self {
            clone_root: tempdir()?,
            store: MemoryBlobStore::new(),
            violations: MemoryViolationSource::new(),
            urls: StaticCloneUrls::new(),
            config: PipelineConfig::default(),
            excluded: Vec::new(),
        })
    }

    fn clone_manager(&self) -> CloneManager {
        CloneManager::new(self.clone_root.path()).with_exclusions(self.excluded.clone())
    }

    fn pipeline_with_sink(&self, sink: Arc<dyn AttributionSink>) -> AttributionPipeline {
        AttributionPipeline::new(
            self.config.clone(),
            self.clone_manager(),
            Arc::new(self.urls.clone()),
            Arc::new(self.violations.clone()),
            Arc::new(self.store.clone()),
            sink,
        )
    }

    fn pipeline(&self) -> AttributionPipeline {
        self.pipeline_with_sink(Arc::new(BlobQueueSink::new(Arc::new(self.store.clone()))))
    }

    fn staged_updates(&self) -> Vec<AttributionUpdate> {
        self.store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("updateViolationsResourcesBlameQueue/"))
            .flat_map(|key| {
                let body: serde_json::Value =
                    serde_json::from_slice(&self.store.get(&key).unwrap().unwrap()).unwrap();
                assert_eq!(body["customerName"], TENANT);
                serde_json::from_value::<Vec<AttributionUpdate>>(body["resources"].clone()).unwrap()
            })
            .collect()
    }

    fn assert_no_clones_left(&self, repository: &RepositoryRef) {
        assert!(!self.clone_manager().clone_dir(TENANT, repository).exists());
    }
}

fn infra() -> RepositoryRef {
    RepositoryRef::new("acme", "infra")
}

fn run(pipeline: &AttributionPipeline, repositories: &[RepositoryRef]) -> PipelineSummary {
    pipeline
        .run(TENANT, VcsKind::Github, repositories)
        .expect("run should not abort")
}

#[test]
fn test_end_to_end_attribution() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.urls.insert("acme/infra", fixture.url.clone());
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Inline(scenario_violations()),
    );
    let invoker = Arc::new(CountingInvoker::default());
    let pipeline = harness.pipeline().with_invoker(invoker.clone());

    let summary = run(&pipeline, &[infra()]);
    let report = summary.report("acme/infra").unwrap();

    assert_eq!(report.status, RepositoryStatus::Done);
    assert_eq!(report.pending, 4);
    assert_eq!(report.attributed, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.cache_keys.get("main.tf"), Some(&2));
    assert_eq!(report.distinct_cache_keys(), 2);
    assert_eq!(report.chunks_delivered, 1);
    assert!(!summary.has_failures());

    // One git invocation per file; vars.tf had nothing attributable.
    assert_eq!(invoker.calls(), vec!["main.tf".to_string()]);
    assert_eq!(report.blame_invocations, 1);

    let updates = harness.staged_updates();
    assert_eq!(updates.len(), 3);
    let by_id = |id: &str| {
        updates
            .iter()
            .find(|u| u.resource_id == id)
            .unwrap()
            .attribution()
    };

    let shared = by_id("v1::src::r1");
    assert_eq!(shared, by_id("v2::src::r2"));
    assert_eq!(shared.author, "Jane Doe");
    assert!(fixture.jane_commit.starts_with(&shared.commit_hash));
    assert_eq!(shared.date.timestamp(), JANE_TIME);

    let edited = by_id("v3::src::r3");
    assert_eq!(edited.author, "Bob Stone");
    assert!(fixture.bob_commit.starts_with(&edited.commit_hash));
    assert_eq!(edited.date.timestamp(), BOB_TIME);

    harness.assert_no_clones_left(&infra());
    Ok(())
}

#[test]
fn test_window_takes_most_recent_line() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.urls.insert("acme/infra", fixture.url.clone());
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Inline(vec![violation("1", "main.tf", vec![1, 5], None)]),
    );

    let summary = run(&harness.pipeline(), &[infra()]);
    assert_eq!(summary.attributed(), 1);
    let updates = harness.staged_updates();
    assert_eq!(updates[0].attribution().author, "Bob Stone");
    Ok(())
}

#[test]
fn test_excluded_repository_is_never_cloned() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.excluded.push("acme/huge".into());
    harness.violations.insert(
        TENANT,
        "acme/huge",
        PendingAttributions::Inline(scenario_violations()),
    );
    let invoker = Arc::new(CountingInvoker::default());
    // No clone URL configured: resolving one would abort the run.
    let pipeline = harness.pipeline().with_invoker(invoker.clone());

    let huge = RepositoryRef::new("acme", "huge");
    let summary = run(&pipeline, &[huge.clone()]);
    let report = summary.report("acme/huge").unwrap();

    assert_eq!(report.status, RepositoryStatus::Skipped);
    assert_eq!(report.attributed, 0);
    assert!(invoker.calls().is_empty());
    assert!(harness.store.is_empty());
    harness.assert_no_clones_left(&huge);
    Ok(())
}

#[test]
fn test_staged_violations_are_read_from_blob_store() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.urls.insert("acme/infra", fixture.url.clone());
    put_json(
        &harness.store,
        "pending/acme/infra.json",
        &StagedViolations {
            violation_resources: scenario_violations(),
        },
        None,
    )?;
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Staged {
            key: "pending/acme/infra.json".into(),
        },
    );

    let summary = run(&harness.pipeline(), &[infra()]);
    assert_eq!(summary.attributed(), 3);
    assert_eq!(harness.staged_updates().len(), 3);
    Ok(())
}

#[test]
fn test_missing_staged_batch_fails_repository() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.urls.insert("acme/infra", fixture.url.clone());
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Staged {
            key: "pending/missing.json".into(),
        },
    );

    let summary = run(&harness.pipeline(), &[infra()]);
    assert!(summary.has_failures());
    harness.assert_no_clones_left(&infra());
    Ok(())
}

#[test]
fn test_clone_failure_does_not_stop_other_repositories() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    let broken = RepositoryRef::new("acme", "broken");
    harness.urls.insert("acme/infra", fixture.url.clone());
    harness
        .urls
        .insert("acme/broken", CloneUrl::new("file:///nonexistent/blameline/broken"));
    for repo in ["acme/infra", "acme/broken"] {
        harness.violations.insert(
            TENANT,
            repo,
            PendingAttributions::Inline(scenario_violations()),
        );
    }

    let summary = run(&harness.pipeline(), &[broken.clone(), infra()]);

    assert!(matches!(
        summary.report("acme/broken").unwrap().status,
        RepositoryStatus::Failed { .. }
    ));
    assert_eq!(summary.report("acme/infra").unwrap().attributed, 3);
    assert!(summary.has_failures());
    harness.assert_no_clones_left(&broken);
    harness.assert_no_clones_left(&infra());
    Ok(())
}

#[test]
fn test_unresolvable_clone_url_aborts_run() -> Result<()> {
    let harness = Harness::new()?;
    let result = harness
        .pipeline()
        .run(TENANT, VcsKind::Gitlab, &[infra()]);
    assert!(matches!(
        result,
        Err(PipelineError::CloneUrlResolution { ref repository, .. }) if repository == "acme/infra"
    ));
    Ok(())
}

#[test]
fn test_nothing_pending_means_no_clone() -> Result<()> {
    let mut harness = Harness::new()?;
    // Cloning this would fail the repository.
    harness
        .urls
        .insert("acme/infra", CloneUrl::new("file:///nonexistent/blameline/infra"));

    let summary = run(&harness.pipeline(), &[infra()]);
    let report = summary.report("acme/infra").unwrap();
    assert_eq!(report.status, RepositoryStatus::Done);
    assert_eq!(report.pending, 0);
    assert!(report.clone_size_mb.is_none());
    Ok(())
}

#[test]
fn test_chunks_are_delivered_independently() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.config.chunk_size = 2;
    harness.urls.insert("acme/infra", fixture.url.clone());
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Inline(scenario_violations()),
    );
    let sink = Arc::new(FlakySink {
        failures: 1,
        calls: AtomicUsize::new(0),
        accepted: Mutex::new(Vec::new()),
    });

    let summary = run(&harness.pipeline_with_sink(sink.clone()), &[infra()]);
    let report = summary.report("acme/infra").unwrap();

    assert_eq!(report.chunks_failed, 1);
    assert_eq!(report.chunks_delivered, 1);
    assert_eq!(sink.accepted.lock().unwrap().len(), 1);
    assert!(matches!(report.status, RepositoryStatus::Failed { .. }));
    harness.assert_no_clones_left(&infra());
    Ok(())
}

#[test]
fn test_consecutive_failures_abandon_repository() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.config.max_consecutive_failures = 2;
    harness.urls.insert("acme/infra", fixture.url.clone());
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Inline(vec![
            violation("1", "a.tf", vec![1, 2], None),
            violation("2", "b.tf", vec![1, 2], None),
            violation("3", "c.tf", vec![1, 2], None),
        ]),
    );

    let summary = run(
        &harness.pipeline().with_invoker(Arc::new(FailingInvoker)),
        &[infra()],
    );
    let report = summary.report("acme/infra").unwrap();

    assert_eq!(
        report.status,
        RepositoryStatus::Failed {
            reason: "consecutive failures".into()
        }
    );
    assert_eq!(report.attributed, 0);
    assert!(harness.store.is_empty());
    harness.assert_no_clones_left(&infra());
    Ok(())
}

#[test]
fn test_unit_failures_are_skips_when_guard_disabled() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.config.max_consecutive_failures = 0;
    harness.urls.insert("acme/infra", fixture.url.clone());
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Inline(vec![
            violation("1", "main.tf", vec![1, 2], None),
            violation("2", "missing.tf", vec![1, 2], None),
            violation("3", "main.tf", vec![40, 50], None),
        ]),
    );

    let summary = run(&harness.pipeline(), &[infra()]);
    let report = summary.report("acme/infra").unwrap();

    assert_eq!(report.status, RepositoryStatus::Done);
    assert_eq!(report.attributed, 1);
    assert_eq!(report.skipped, 2);
    Ok(())
}

#[test]
fn test_stale_file_does_not_abandon_healthy_results() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.urls.insert("acme/infra", fixture.url.clone());

    // vars.tf has three lines; every window below lies past its end
    let mut violations: Vec<ViolationResource> = (0..10)
        .map(|i| violation(&format!("good{}", i), "main.tf", vec![1, 5], None))
        .collect();
    violations.extend(
        (0..60u32).map(|i| violation(&format!("stale{}", i), "vars.tf", vec![40 + i, 41 + i], None)),
    );
    harness
        .violations
        .insert(TENANT, "acme/infra", PendingAttributions::Inline(violations));
    assert_eq!(harness.config.max_consecutive_failures, 50);

    let summary = run(&harness.pipeline(), &[infra()]);
    let report = summary.report("acme/infra").unwrap();

    assert_eq!(report.status, RepositoryStatus::Done);
    assert_eq!(report.attributed, 10);
    assert_eq!(report.skipped, 60);
    assert_eq!(report.chunks_delivered, 1);
    assert_eq!(harness.staged_updates().len(), 10);
    Ok(())
}

#[test]
fn test_files_without_attributions_trip_the_guard() -> Result<()> {
    let fixture = fixture()?;
    let mut harness = Harness::new()?;
    harness.config.max_consecutive_failures = 2;
    harness.urls.insert("acme/infra", fixture.url.clone());
    // Both files exist, but no window of either is inside them
    harness.violations.insert(
        TENANT,
        "acme/infra",
        PendingAttributions::Inline(vec![
            violation("1", "main.tf", vec![40, 41], None),
            violation("2", "vars.tf", vec![40, 41], None),
        ]),
    );

    let summary = run(&harness.pipeline(), &[infra()]);
    let report = summary.report("acme/infra").unwrap();

    assert_eq!(
        report.status,
        RepositoryStatus::Failed {
            reason: "consecutive failures".into()
        }
    );
    assert!(harness.store.is_empty());
    Ok(())
}
