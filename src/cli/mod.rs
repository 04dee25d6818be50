//! CLI command definitions and handlers

mod attribute;
mod clone_errors;
mod purge;
mod snapshot;
mod stats;

use anyhow::Result;
use blameline::config::{load_config, BlamelineConfig};
use blameline::models::RepositoryRef;
use blameline::vcs::VcsKind;
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

fn parse_repository(s: &str) -> Result<RepositoryRef, String> {
    RepositoryRef::parse(s)
}

/// Accepts epoch milliseconds or an RFC 3339 timestamp.
fn parse_execution_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(millis) = s.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| format!("'{}' is out of range", s));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("'{}' is neither epoch milliseconds nor RFC 3339", s))
}

/// Reject values git would read as options.
fn parse_log_window(s: &str) -> Result<String, String> {
    if s.is_empty() || s.starts_with('-') {
        Err(format!("invalid log window '{}'", s))
    } else {
        Ok(s.to_string())
    }
}

/// blameline - attribute policy violations to the commits that introduced them
#[derive(Parser, Debug)]
#[command(name = "blameline")]
#[command(
    version,
    about = "Attribute policy violations to the commit, author and date that last touched them",
    after_help = "\
Examples:
  blameline attribute --tenant acme --source github --repo acme/infra
  blameline stats .                                   Contributor activity of a local repo
  blameline clone-stats --tenant acme --source gitlab --repo acme/infra
  blameline snapshot --tenant acme --source github --repo acme/infra@main --prefix scans/1
  blameline clone-errors --tenant acme --execution-time 1709287200000
  blameline purge                                     Drop expired staged blobs"
)]
pub struct Cli {
    /// Config file (default: ./blameline.toml, then ~/.config/blameline/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", value_parser = ["error", "warn", "info", "debug", "trace"])]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attribute pending violations of each repository to commits
    #[command(after_help = "\
Exit code is 1 when any repository failed.")]
    Attribute {
        #[arg(long)]
        tenant: String,

        /// VCS source (github, githubEnterprise, gitlab, gitlabEnterprise, bitbucket, bitbucketEnterprise, azureRepos)
        #[arg(long)]
        source: VcsKind,

        /// Repository as owner/name (repeatable)
        #[arg(long = "repo", required = true, value_parser = parse_repository)]
        repositories: Vec<RepositoryRef>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Contributor and weekly commit statistics of a local repository
    Stats {
        /// Repository path
        #[arg(default_value = ".")]
        path: PathBuf,

        /// git log --since window (default from config: 90.days)
        #[arg(long, value_parser = parse_log_window)]
        since: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Clone repositories, save their statistics and record clone results
    CloneStats {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        source: VcsKind,

        #[arg(long = "repo", required = true, value_parser = parse_repository)]
        repositories: Vec<RepositoryRef>,

        /// Scan time the results are filed under (default: now)
        #[arg(long, value_parser = parse_execution_time)]
        execution_time: Option<DateTime<Utc>>,
    },

    /// Shallow-clone repositories and upload their files for scanning
    Snapshot {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        source: VcsKind,

        /// Repository as owner/name@branch (repeatable)
        #[arg(long = "repo", required = true, value_parser = parse_repository)]
        repositories: Vec<RepositoryRef>,

        /// Blob key prefix for the uploaded files
        #[arg(long)]
        prefix: String,

        /// Commit to check out when the branch no longer exists
        #[arg(long)]
        commit: Option<String>,
    },

    /// Show failed clones recorded for a scan
    CloneErrors {
        #[arg(long)]
        tenant: String,

        #[arg(long, value_parser = parse_execution_time)]
        execution_time: DateTime<Utc>,

        #[arg(long)]
        source: Option<VcsKind>,
    },

    /// Delete expired blobs from the local store
    Purge,
}

fn config(cli: &Cli) -> Result<BlamelineConfig> {
    load_config(cli.config.as_deref())
}

/// Run the CLI with parsed arguments
pub fn run(cli: Cli) -> Result<ExitCode> {
    let config = config(&cli)?;
    match cli.command {
        Commands::Attribute {
            tenant,
            source,
            repositories,
            json,
        } => attribute::run(&config, &tenant, source, &repositories, json),

        Commands::Stats { path, since, json } => {
            let since = since.unwrap_or_else(|| config.stats.log_since.clone());
            stats::run_local(&path, &since, json).map(|_| ExitCode::SUCCESS)
        }

        Commands::CloneStats {
            tenant,
            source,
            repositories,
            execution_time,
        } => stats::run_clone_stats(
            &config,
            &tenant,
            source,
            &repositories,
            execution_time.unwrap_or_else(Utc::now),
        ),

        Commands::Snapshot {
            tenant,
            source,
            repositories,
            prefix,
            commit,
        } => snapshot::run(
            &config,
            &tenant,
            source,
            &repositories,
            &prefix,
            commit.as_deref(),
        )
        .map(|_| ExitCode::SUCCESS),

        Commands::CloneErrors {
            tenant,
            execution_time,
            source,
        } => clone_errors::run(&config, &tenant, execution_time, source).map(|_| ExitCode::SUCCESS),

        Commands::Purge => purge::run(&config).map(|_| ExitCode::SUCCESS),
    }
}
