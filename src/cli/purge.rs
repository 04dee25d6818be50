//! Purge command - remove expired blobs from the local store

use anyhow::Result;
use blameline::config::BlamelineConfig;
use blameline::storage::FsBlobStore;
use chrono::Utc;
use console::style;

pub fn run(config: &BlamelineConfig) -> Result<()> {
    let store = FsBlobStore::new(config.storage_root());
    let removed = store.purge_expired(Utc::now())?;
    println!(
        "Purged {} expired blob{} from {}",
        style(removed).cyan(),
        if removed == 1 { "" } else { "s" },
        style(store.root().display()).dim()
    );
    Ok(())
}
