//! Git log activity statistics
//!
//! Parses `git log --pretty=format:"%ad %ae %an"` output into a deduplicated
//! contributor list and two sliding weekly commit counters.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Default history window passed to `git log --since`.
pub const DEFAULT_LOG_SINCE: &str = "90.days";

/// git's stderr for a repository without commits.
const NO_COMMITS_MESSAGE: &str = "does not have any commits yet";

/// `%ad` in git's default date format spans six tokens:
/// `Tue May 31 13:11:01 2022 +0300`.
const DATE_TOKENS: usize = 6;
const GIT_DEFAULT_DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y %z";

/// A contributor seen in the log window, unique by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    #[serde(rename = "contributorEmail")]
    pub email: String,
    #[serde(rename = "contributorUsername")]
    pub username: String,
}

/// Commit counts for the last week and the week before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitWindows {
    pub current_week_commits: usize,
    pub prev_week_commits: usize,
}

/// Parsed activity for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryActivity {
    #[serde(rename = "contributorsData")]
    pub contributors: Vec<Contributor>,
    #[serde(flatten)]
    pub commits: CommitWindows,
    /// Malformed lines that were skipped
    #[serde(skip)]
    pub skipped_lines: usize,
}

/// Which window a commit date falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitWindow {
    CurrentWeek,
    PreviousWeek,
    Older,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogEntry {
    date: DateTime<Utc>,
    email: String,
    username: String,
}

/// Parser for `git log` activity.
///
/// `now` is fixed at construction so every line is classified against the
/// same boundaries.
#[derive(Debug, Clone)]
pub struct GitLogParser {
    now: DateTime<Utc>,
    one_week_ago: DateTime<Utc>,
    two_weeks_ago: DateTime<Utc>,
}

impl Default for GitLogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl GitLogParser {
    pub fn new() -> Self {
        Self::with_now(Utc::now())
    }

    pub fn with_now(now: DateTime<Utc>) -> Self {
        Self {
            now,
            one_week_ago: now - Duration::days(7),
            two_weeks_ago: now - Duration::days(14),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn classify(&self, date: DateTime<Utc>) -> CommitWindow {
        if date >= self.one_week_ago {
            CommitWindow::CurrentWeek
        } else if date >= self.two_weeks_ago {
            CommitWindow::PreviousWeek
        } else {
            CommitWindow::Older
        }
    }

    /// Parse a whole log. Malformed lines are logged and skipped.
    pub fn parse(&self, log: &str) -> RepositoryActivity {
        let mut activity = RepositoryActivity::default();
        let mut seen_emails = HashSet::new();

        let lines: Vec<&str> = log.lines().filter(|l| !l.trim().is_empty()).collect();
        debug!("Parsing {} git log lines", lines.len());

        for line in lines {
            let Some(entry) = parse_log_line(line) else {
                warn!("Corrupted line while parsing git log, skipped: {:?}", line);
                activity.skipped_lines += 1;
                continue;
            };

            if seen_emails.insert(entry.email.clone()) {
                activity.contributors.push(Contributor {
                    email: entry.email,
                    username: entry.username,
                });
            }

            match self.classify(entry.date) {
                CommitWindow::CurrentWeek => activity.commits.current_week_commits += 1,
                CommitWindow::PreviousWeek => activity.commits.prev_week_commits += 1,
                CommitWindow::Older => {}
            }
        }

        activity
    }
}

/// `Tue May 31 13:11:01 2022 +0300 user@example.com User Name`
fn parse_log_line(line: &str) -> Option<LogEntry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() <= DATE_TOKENS + 1 {
        return None;
    }

    let date_str = tokens[..DATE_TOKENS].join(" ");
    let date = DateTime::parse_from_str(&date_str, GIT_DEFAULT_DATE_FORMAT)
        .ok()?
        .with_timezone(&Utc);

    let email = tokens[DATE_TOKENS].to_string();
    let username = tokens[DATE_TOKENS + 1..].join(" ");
    if email.is_empty() || username.is_empty() {
        return None;
    }

    Some(LogEntry {
        date,
        email,
        username,
    })
}

/// Run `git log` over `since` in `repo_path`.
///
/// A repository without any commits yields an empty log.
pub fn read_git_log(repo_path: &Path, since: &str) -> Result<String> {
    if since.starts_with('-') {
        anyhow::bail!("Invalid log window '{}': cannot start with '-'", since);
    }

    let output = Command::new("git")
        .arg("log")
        .arg(format!("--since={}", since))
        .arg("--date=default")
        .arg("--pretty=format:%ad %ae %an")
        .current_dir(repo_path)
        .output()
        .with_context(|| format!("Failed to run git log in {}", repo_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(NO_COMMITS_MESSAGE) {
            debug!("{} has no commits yet", repo_path.display());
            return Ok(String::new());
        }
        anyhow::bail!("git log failed: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Read and parse the activity of the repository at `repo_path`.
pub fn collect_activity(repo_path: &Path, since: &str) -> Result<RepositoryActivity> {
    let log = read_git_log(repo_path, since)?;
    Ok(GitLogParser::new().parse(&log))
}
