//! Configuration module for blameline
//!
//! This module handles:
//! - Run configuration (`blameline.toml`)
//! - Environment overrides
//! - Operator-provided clone URLs

mod settings;

pub use settings::{
    load_config, BlamelineConfig, CloneSettings, PipelineSettings, StatsSettings,
    StorageSettings, CONFIG_FILE_NAME, ENV_CHUNK_SIZE, ENV_CLONE_ROOT,
};
