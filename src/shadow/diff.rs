//! Status and diff parsing.

use serde::{Deserialize, Serialize};

/// Counts derived from `git status --porcelain`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub modified: usize,
    pub added: usize,
    pub deleted: usize,
}

impl ChangeSummary {
    pub fn from_porcelain(status: &str) -> Self {
        let mut summary = Self::default();
        for line in status.lines() {
            let code = line.get(..2).unwrap_or(line);
            if code == "??" || code.contains('A') {
                summary.added += 1;
            } else if code.contains('D') {
                summary.deleted += 1;
            } else if !code.trim().is_empty() {
                summary.modified += 1;
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.modified + self.added + self.deleted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub additions: usize,
    pub deletions: usize,
    pub files: usize,
}

impl DiffStats {
    pub fn from_diff(diff: &str) -> Self {
        let mut stats = Self::default();
        // `---`/`+++` are file names only between `diff --git` and the first hunk.
        let mut in_header = false;
        for line in diff.lines() {
            if line.starts_with("diff --git ") {
                stats.files += 1;
                in_header = true;
            } else if line.starts_with("@@") {
                in_header = false;
            } else if in_header {
                continue;
            } else if line.starts_with('+') {
                stats.additions += 1;
            } else if line.starts_with('-') {
                stats.deletions += 1;
            }
        }
        stats
    }
}

/// Everything a client needs to render the current diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffData {
    pub status: String,
    pub diff: String,
    pub untracked_files: Vec<String>,
    pub stats: DiffStats,
}

/// Paths that are new relative to HEAD, from porcelain status lines.
///
/// Everything is staged after a sync, so new files show up as `A ` rather
/// than `??`; both forms count.
pub fn new_files(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| {
            let code = line.get(..2)?;
            let path = line.get(3..)?;
            (code == "??" || code.starts_with('A')).then(|| unquote(path))
        })
        .collect()
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
