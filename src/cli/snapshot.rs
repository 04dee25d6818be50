//! Snapshot command - upload repository files for scanning

use anyhow::Result;
use blameline::config::BlamelineConfig;
use blameline::models::RepositoryRef;
use blameline::snapshot::{SnapshotTarget, Snapshotter};
use blameline::storage::FsBlobStore;
use blameline::vcs::VcsKind;
use std::sync::Arc;

pub fn run(
    config: &BlamelineConfig,
    tenant: &str,
    source: VcsKind,
    repositories: &[RepositoryRef],
    prefix: &str,
    commit: Option<&str>,
) -> Result<()> {
    let snapshotter = Snapshotter::new(
        config.clone_manager(),
        Arc::new(config.clone_urls()),
        Arc::new(FsBlobStore::new(config.storage_root())),
    );
    let targets: Vec<SnapshotTarget> = repositories
        .iter()
        .cloned()
        .map(SnapshotTarget::from)
        .collect();

    let scan_paths = snapshotter.snapshot_repositories(tenant, source, &targets, prefix, commit)?;
    println!("{}", serde_json::to_string_pretty(&scan_paths)?);
    Ok(())
}
