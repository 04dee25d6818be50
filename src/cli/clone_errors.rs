//! Clone-errors command

use anyhow::Result;
use blameline::config::BlamelineConfig;
use blameline::stats::CloneResultLog;
use blameline::storage::FsBlobStore;
use blameline::vcs::VcsKind;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub fn run(
    config: &BlamelineConfig,
    tenant: &str,
    execution_time: DateTime<Utc>,
    source: Option<VcsKind>,
) -> Result<()> {
    let log = CloneResultLog::new(Arc::new(FsBlobStore::new(config.storage_root())));
    let errors = log.clone_errors_for_scan(tenant, execution_time, source)?;
    println!("{}", serde_json::to_string_pretty(&errors)?);
    Ok(())
}
