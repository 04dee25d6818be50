//! Stats commands - local activity and statistics clones

use anyhow::{Context, Result};
use blameline::config::BlamelineConfig;
use blameline::git::collect_activity;
use blameline::models::RepositoryRef;
use blameline::stats::{CloneResultLog, StatsCollector};
use blameline::storage::{BlobStore, FsBlobStore};
use blameline::vcs::{BlobStatsSink, VcsKind};
use chrono::{DateTime, Utc};
use console::style;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

/// Print activity of the repository at `path`.
pub fn run_local(path: &Path, since: &str, json: bool) -> Result<()> {
    let repo_path = path
        .canonicalize()
        .with_context(|| format!("Path does not exist: {}", path.display()))?;
    let activity = collect_activity(&repo_path, since)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&activity)?);
        return Ok(());
    }

    println!("\nActivity of {} since {}\n", style(repo_path.display()).cyan(), since);
    println!(
        "  This week: {}   Previous week: {}",
        style(activity.commits.current_week_commits).cyan(),
        style(activity.commits.prev_week_commits).cyan()
    );
    println!("\n  {} contributors:", activity.contributors.len());
    for contributor in &activity.contributors {
        println!(
            "    {} {}",
            contributor.username,
            style(format!("<{}>", contributor.email)).dim()
        );
    }
    if activity.skipped_lines > 0 {
        println!(
            "\n  {} malformed log lines skipped",
            style(activity.skipped_lines).yellow()
        );
    }
    println!();
    Ok(())
}

pub fn run_clone_stats(
    config: &BlamelineConfig,
    tenant: &str,
    source: VcsKind,
    repositories: &[RepositoryRef],
    execution_time: DateTime<Utc>,
) -> Result<ExitCode> {
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage_root()));
    let collector = StatsCollector::new(
        config.clone_manager(),
        Arc::new(config.clone_urls()),
        Arc::new(BlobStatsSink::new(store.clone())),
    )
    .with_log_since(config.stats.log_since.clone());

    let results: Vec<_> = repositories
        .iter()
        .map(|repository| collector.clone_repository_stats(tenant, source, repository, None))
        .collect();

    CloneResultLog::new(store)
        .with_expiry_days(config.storage.result_expiry_days)
        .append(tenant, execution_time, Some(source), &results)?;

    println!(
        "\nStatistics clones for {} at {}\n",
        style(tenant).cyan(),
        execution_time.timestamp_millis()
    );
    for result in &results {
        match &result.error {
            None => println!(
                "  {} {}  {:.2} MB in {}ms",
                style("[OK]  ").green(),
                style(&result.repository_name).bold(),
                result.clone_size_mb.unwrap_or_default(),
                result.clone_duration_ms.unwrap_or_default()
            ),
            Some(error) => println!(
                "  {} {}  {}",
                style("[FAIL]").red(),
                style(&result.repository_name).bold(),
                error
            ),
        }
    }
    println!();

    Ok(if results.iter().any(|r| r.is_failed()) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
