//! Git blame attribution
//!
//! Runs `git blame -t` once per file and resolves line windows against the
//! raw text output. Whitespace is collapsed and the author/timestamp are
//! located by scanning the parenthesized block, so column widths do not matter.

use chrono::{TimeZone, Utc};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

use super::resolver::LineSelection;
use crate::cache::{BlameCache, BlameCacheKey};
use crate::models::BlameAttribution;

/// Failures scoped to one file or one resource. All of them are skip-worthy:
/// the pipeline logs them and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlameError {
    #[error("git blame failed for {file_path}: {message}")]
    Invocation { file_path: String, message: String },

    #[error("git blame output is empty for {file_path}")]
    EmptyBlame { file_path: String },

    #[error(
        "trying to access unknown lines {selection} in {file_path} ({available} blame lines available)"
    )]
    UnknownLines {
        file_path: String,
        selection: LineSelection,
        available: usize,
    },

    #[error("no usable blame lines for {selection} in {file_path}")]
    NoBlameLines {
        file_path: String,
        selection: LineSelection,
    },
}

impl BlameError {
    /// Stable classification code, as reported downstream.
    pub fn code(&self) -> &'static str {
        match self {
            BlameError::Invocation { .. } => "BLAME_CALC_ERROR",
            BlameError::EmptyBlame { .. } => "EMPTY_GIT_BLAME",
            BlameError::UnknownLines { .. } => "UNKNOWN_LINES",
            BlameError::NoBlameLines { .. } => "NO_BLAME_LINES",
        }
    }
}

/// Produces raw `git blame -t` text for one file of a clone.
pub trait BlameInvoker: Send + Sync {
    fn blame_file(&self, repo_path: &Path, file_path: &str) -> Result<String, BlameError>;
}

/// [`BlameInvoker`] backed by the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitBlameInvoker;

impl BlameInvoker for GitBlameInvoker {
    fn blame_file(&self, repo_path: &Path, file_path: &str) -> Result<String, BlameError> {
        // `--` keeps paths that start with '-' from being read as flags
        let output = Command::new("git")
            .args(["blame", "-t", "--", file_path])
            .current_dir(repo_path)
            .output()
            .map_err(|e| BlameError::Invocation {
                file_path: file_path.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BlameError::Invocation {
                file_path: file_path.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// One parsed line of blame output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlameLine {
    pub commit_hash: String,
    pub author: String,
    pub timestamp_millis: i64,
}

impl RawBlameLine {
    fn into_attribution(self) -> Option<BlameAttribution> {
        let date = Utc.timestamp_millis_opt(self.timestamp_millis).single()?;
        Some(BlameAttribution {
            author: self.author,
            commit_hash: self.commit_hash,
            date,
        })
    }
}

/// Parse one line of `git blame -t` output:
/// `<hash> (<author...> <unix-seconds> <tz> <lineno>) <text>`.
///
/// Returns `None` when no commit hash or no numeric timestamp can be found.
pub fn parse_blame_line(line: &str) -> Option<RawBlameLine> {
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

    let commit_hash: String = collapsed
        .split(' ')
        .next()?
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if commit_hash.is_empty() {
        return None;
    }

    let open = collapsed.find('(')?;
    let close = collapsed.rfind(')')?;
    if close <= open {
        return None;
    }

    let mut author = Vec::new();
    let mut seconds = None;
    for token in collapsed[open + 1..close].split(' ') {
        if is_numeric(token) {
            seconds = Some(token.parse::<i64>().ok()?);
            break;
        }
        author.push(token);
    }

    Some(RawBlameLine {
        commit_hash,
        author: author.join(" ").trim().to_string(),
        timestamp_millis: seconds?.checked_mul(1000)?,
    })
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

/// Pick the most recent line. On equal timestamps the later line in the
/// window wins; which editor that is carries no meaning.
pub fn most_recent(lines: impl IntoIterator<Item = RawBlameLine>) -> Option<RawBlameLine> {
    lines.into_iter().max_by_key(|line| line.timestamp_millis)
}

/// Blame output of one file, split into lines.
#[derive(Debug, Clone)]
pub struct BlameOutput {
    file_path: String,
    lines: Vec<String>,
}

impl BlameOutput {
    pub fn from_raw(file_path: impl Into<String>, raw: &str) -> Self {
        let mut lines: Vec<String> = raw
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        Self {
            file_path: file_path.into(),
            lines,
        }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when git printed nothing but blank lines.
    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    /// Raw output lines covered by `selection`.
    pub fn window(&self, selection: LineSelection) -> Result<&[String], BlameError> {
        if self.is_empty() {
            return Err(BlameError::EmptyBlame {
                file_path: self.file_path.clone(),
            });
        }

        let (from, to) = selection.output_bounds();
        // Past the end means the scanned snapshot and the clone disagree
        if from > self.lines.len() {
            return Err(BlameError::UnknownLines {
                file_path: self.file_path.clone(),
                selection,
                available: self.lines.len(),
            });
        }

        let to = to.min(self.lines.len()).max(from);
        Ok(&self.lines[from..to])
    }

    /// Parse the lines covered by `selection`. Parsing stops at the first
    /// empty line; lines without a timestamp are skipped.
    pub fn parse_window(&self, selection: LineSelection) -> Result<Vec<RawBlameLine>, BlameError> {
        let window = self.window(selection)?;
        let mut parsed = Vec::with_capacity(window.len());
        for line in window {
            if line.is_empty() {
                break;
            }
            match parse_blame_line(line) {
                Some(raw) => parsed.push(raw),
                None => warn!(
                    "Unparsable blame line in {} ({}): {:?}",
                    self.file_path, selection, line
                ),
            }
        }
        Ok(parsed)
    }

    /// Most recent attribution within `selection`.
    pub fn attribute(&self, selection: LineSelection) -> Result<BlameAttribution, BlameError> {
        let parsed = self.parse_window(selection)?;
        most_recent(parsed)
            .and_then(RawBlameLine::into_attribution)
            .ok_or_else(|| BlameError::NoBlameLines {
                file_path: self.file_path.clone(),
                selection,
            })
    }
}

/// Resolves attributions for one file of one tenant, memoized in a cache
/// shared by every resource of that file.
#[derive(Clone)]
pub struct BlameParser<'a> {
    tenant: &'a str,
    output: &'a BlameOutput,
    cache: &'a BlameCache,
}

impl<'a> BlameParser<'a> {
    pub fn new(tenant: &'a str, output: &'a BlameOutput, cache: &'a BlameCache) -> Self {
        Self {
            tenant,
            output,
            cache,
        }
    }

    pub fn attribute(&self, selection: LineSelection) -> Result<BlameAttribution, BlameError> {
        let key = BlameCacheKey::new(self.tenant, selection, self.output.file_path());
        self.cache.get_or_try_insert_with(key, || {
            debug!(
                "Computing blame for {}:{} (tenant {})",
                self.output.file_path(),
                selection,
                self.tenant
            );
            self.output.attribute(selection)
        })
    }
}
