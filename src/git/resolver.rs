//! Blame line resolution
//!
//! Turns a resource's declared span and optional error lines into the one
//! window of lines whose blame we attribute.

use crate::models::ViolationResource;

/// The `(start, end)` window chosen for a resource (1-indexed, inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineSelection {
    pub start_line: u32,
    pub end_line: u32,
}

impl LineSelection {
    pub fn new(start_line: u32, end_line: u32) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    pub fn single(line: u32) -> Self {
        Self::new(line, line)
    }

    /// Zero-based `[from, to)` slice bounds into blame output lines.
    ///
    /// Line 0 is treated as the first line, and a `0..0` selection still
    /// yields one line.
    pub fn output_bounds(&self) -> (usize, usize) {
        let from = self.start_line.saturating_sub(1) as usize;
        let to = if self.start_line == 0 && self.end_line == 0 {
            1
        } else {
            self.end_line as usize
        };
        (from, to)
    }
}

impl std::fmt::Display for LineSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start_line, self.end_line)
    }
}

/// Pick the window to attribute.
///
/// Without error lines the declared span is used verbatim. With error lines,
/// the first one (in the given order) that falls inside the declared span is
/// used for both bounds. `None` means the resource is not attributable.
pub fn resolve_lines(metadata_lines: &[u32], error_lines: &[u32]) -> Option<LineSelection> {
    let (start, end) = match metadata_lines {
        [start, end, ..] => (*start, *end),
        _ => return None,
    };

    if error_lines.is_empty() {
        return Some(LineSelection::new(start, end));
    }

    error_lines
        .iter()
        .copied()
        .find(|line| (start..=end).contains(line))
        .map(LineSelection::single)
}

/// [`resolve_lines`] for a [`ViolationResource`].
pub fn resolve_resource(resource: &ViolationResource) -> Option<LineSelection> {
    resolve_lines(resource.metadata_lines(), resource.error_lines())
}
