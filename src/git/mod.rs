//! Git integration
//!
//! Everything that touches a clone: the clone lifecycle itself, raw blame
//! invocation and parsing, line window resolution and `git log` activity.
//!
//! # Example
//!
//! ```no_run
//! use blameline::cache::BlameCache;
//! use blameline::git::{resolve_lines, BlameInvoker, BlameOutput, BlameParser, GitBlameInvoker};
//! use std::path::Path;
//!
//! let raw = GitBlameInvoker.blame_file(Path::new("/tmp/clone"), "main.tf").unwrap();
//! let output = BlameOutput::from_raw("main.tf", &raw);
//! let cache = BlameCache::new();
//! let window = resolve_lines(&[3, 9], &[4]).unwrap();
//! let attribution = BlameParser::new("tenant", &output, &cache).attribute(window).unwrap();
//! println!("{} in {}", attribution.author, attribution.commit_hash);
//! ```

pub mod blame;
pub mod clone;
pub mod history;
pub mod resolver;

pub use blame::{
    most_recent, parse_blame_line, BlameError, BlameInvoker, BlameOutput, BlameParser,
    GitBlameInvoker, RawBlameLine,
};
pub use clone::{CloneError, CloneManager, CloneMode, CloneUrl, ClonedRepository};
pub use history::{
    collect_activity, CommitWindows, Contributor, GitLogParser, RepositoryActivity,
    DEFAULT_LOG_SINCE,
};
pub use resolver::{resolve_lines, resolve_resource, LineSelection};
