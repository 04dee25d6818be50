//! Default working directories - uses ~/.cache/blameline/ for clones and staged data

use std::path::{Path, PathBuf};

/// Base directory for everything blameline writes locally.
/// Uses ~/.cache/blameline/ on Unix, %LOCALAPPDATA%/blameline/ on Windows.
fn base_dir() -> PathBuf {
    let base = if cfg!(windows) {
        std::env::var("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".")))
    } else {
        dirs::cache_dir().unwrap_or_else(|| {
            // Fallback to ~/.cache
            dirs::home_dir()
                .map(|h| h.join(".cache"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    };

    base.join("blameline")
}

/// Root under which `<tenant>/<owner>/<name>` clone directories are created.
pub fn default_clone_root() -> PathBuf {
    base_dir().join("clones")
}

/// Root of the filesystem blob store.
pub fn default_storage_root() -> PathBuf {
    base_dir().join("store")
}

/// Directory the filesystem violation source reads from.
pub fn default_violations_dir() -> PathBuf {
    base_dir().join("violations")
}

/// Clone directory for one repository of one tenant.
///
/// Each path component is sanitized so a hostile owner or name cannot escape
/// the root (`..`, separators).
pub fn clone_dir(root: &Path, tenant: &str, owner: &str, name: &str) -> PathBuf {
    root.join(sanitize_component(tenant))
        .join(sanitize_component(owner))
        .join(sanitize_component(name))
}

fn sanitize_component(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
