//! blameline - git blame attribution engine
//!
//! Pins previously detected policy violations to the commit, author and date
//! that last modified the offending lines, and collects contributor activity
//! from `git log`.
//!
//! - [`pipeline`] orchestrates a run over many repositories
//! - [`git`] holds clone lifecycle, blame, line resolution and log parsing
//! - [`vcs`] and [`storage`] are the boundaries to providers and blob storage
//! - [`stats`] and [`snapshot`] are the statistics and scan-snapshot clones

pub mod cache;
pub mod config;
pub mod git;
pub mod models;
pub mod pipeline;
pub mod snapshot;
pub mod stats;
pub mod storage;
pub mod vcs;
