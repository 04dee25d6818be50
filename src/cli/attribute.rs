//! Attribute command - run the attribution pipeline

use anyhow::{Context, Result};
use blameline::config::BlamelineConfig;
use blameline::models::RepositoryRef;
use blameline::pipeline::{AttributionPipeline, PipelineSummary, RepositoryStatus};
use blameline::storage::{BlobStore, FsBlobStore};
use blameline::vcs::{BlobQueueSink, FsViolationSource, VcsKind};
use console::style;
use std::process::ExitCode;
use std::sync::Arc;

pub fn run(
    config: &BlamelineConfig,
    tenant: &str,
    source: VcsKind,
    repositories: &[RepositoryRef],
    json: bool,
) -> Result<ExitCode> {
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage_root()));
    let sink = BlobQueueSink::new(store.clone()).with_expiry_days(config.storage.result_expiry_days);
    let pipeline = AttributionPipeline::new(
        config.pipeline_config(),
        config.clone_manager(),
        Arc::new(config.clone_urls()),
        Arc::new(FsViolationSource::new(config.violations_dir())),
        store,
        Arc::new(sink),
    );

    let summary = pipeline
        .run(tenant, source, repositories)
        .context("Attribution run aborted")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_summary(summary: &PipelineSummary) {
    println!(
        "\nAttribution for {} ({})\n",
        style(&summary.tenant).cyan(),
        summary.kind
    );

    for report in &summary.repositories {
        match &report.status {
            RepositoryStatus::Done => println!(
                "  {} {}  {} attributed, {} skipped, {} filtered, {} chunk{}",
                style("[OK]  ").green(),
                style(&report.repository).bold(),
                style(report.attributed).cyan(),
                report.skipped,
                report.filtered,
                report.chunks_delivered,
                if report.chunks_delivered == 1 { "" } else { "s" }
            ),
            RepositoryStatus::Skipped => println!(
                "  {} {}  on the exclusion list",
                style("[SKIP]").dim(),
                style(&report.repository).bold()
            ),
            RepositoryStatus::Failed { reason } => println!(
                "  {} {}  {}",
                style("[FAIL]").red(),
                style(&report.repository).bold(),
                reason
            ),
        }
    }

    println!(
        "\n  {} attributed, {} skipped across {} repositories\n",
        style(summary.attributed()).cyan(),
        summary.skipped(),
        summary.repositories.len()
    );
}
