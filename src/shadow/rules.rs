//! Include/exclude rules controlling which container files reach the shadow tree.
//!
//! Rules use rsync filter syntax. Every git-tracked file (and each of its
//! ancestor directories) gets an anchored include rule, and all includes are
//! emitted before any exclude: rsync applies the first matching rule, so a
//! tracked file survives even when `.gitignore` or a built-in exclude would
//! drop it.

use std::collections::HashSet;
use std::path::Path;

use glob::{MatchOptions, Pattern};
use tracing::warn;

use super::git;

/// Always excluded: VCS metadata, dependency and build caches, OS artifacts.
pub const BUILTIN_EXCLUDES: &[&str] = &[
    ".git/",
    "node_modules/",
    ".npm/",
    ".pnpm-store/",
    ".yarn/cache/",
    "__pycache__/",
    ".pytest_cache/",
    ".mypy_cache/",
    ".next/cache/",
    ".turbo/",
    ".gradle/",
    "*.pyc",
    ".DS_Store",
    "Thumbs.db",
];

/// Used when the tracked-file list cannot be read.
pub const FALLBACK_EXCLUDES: &[&str] = &[".git/", "node_modules/"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    includes: Vec<String>,
    excludes: Vec<String>,
}

/// Expand one `.gitignore` line into rsync exclude patterns.
///
/// Negations are dropped; rsync filters cannot re-include a path that an
/// earlier gitignore line excluded the same way git does.
pub fn expand_ignore_line(line: &str) -> Vec<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return Vec::new();
    }
    if let Some(dir) = line.strip_suffix('/') {
        if dir.is_empty() {
            return Vec::new();
        }
        return vec![format!("{dir}/"), format!("{dir}/**")];
    }
    if !line.contains('/') {
        return vec![line.to_string(), format!("**/{line}")];
    }
    vec![line.to_string()]
}

impl RuleSet {
    /// Build rules from the tracked-file list and raw `.gitignore` contents.
    pub fn build<S: AsRef<str>>(tracked: &[S], gitignore: Option<&str>) -> Self {
        let mut seen = HashSet::new();
        let mut includes = Vec::new();
        for file in tracked {
            let file = file.as_ref().trim_start_matches('/');
            if file.is_empty() {
                continue;
            }
            let mut prefix = String::new();
            let mut parts = file.split('/').peekable();
            while let Some(part) = parts.next() {
                prefix.push('/');
                prefix.push_str(part);
                let rule = if parts.peek().is_some() {
                    format!("{prefix}/")
                } else {
                    prefix.clone()
                };
                if seen.insert(rule.clone()) {
                    includes.push(rule);
                }
            }
        }

        let mut excludes = Vec::new();
        let mut push = |pattern: String| {
            if !excludes.contains(&pattern) {
                excludes.push(pattern);
            }
        };
        for line in gitignore.unwrap_or_default().lines() {
            for pattern in expand_ignore_line(line) {
                push(pattern);
            }
        }
        for builtin in BUILTIN_EXCLUDES {
            for pattern in expand_ignore_line(builtin) {
                push(pattern);
            }
        }

        Self { includes, excludes }
    }

    /// Minimal rule set: no includes, only the fallback excludes.
    pub fn fallback() -> Self {
        let excludes = FALLBACK_EXCLUDES
            .iter()
            .flat_map(|p| expand_ignore_line(p))
            .collect();
        Self {
            includes: Vec::new(),
            excludes,
        }
    }

    /// Rules for the repository at `repo_path`: its index and `.gitignore`.
    /// Falls back to [`RuleSet::fallback`] if the index can't be read.
    pub fn for_repo(repo_path: &Path) -> Self {
        match git::tracked_files(repo_path) {
            Ok(tracked) => {
                let gitignore = std::fs::read_to_string(repo_path.join(".gitignore")).ok();
                Self::build(&tracked, gitignore.as_deref())
            }
            Err(e) => {
                warn!(repo = %repo_path.display(), error = %format!("{e:#}"), "could not list tracked files, using fallback excludes");
                Self::fallback()
            }
        }
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    /// Render as an rsync merge file: includes first, then excludes.
    pub fn to_filter_rules(&self) -> String {
        let mut out = String::new();
        for rule in &self.includes {
            out.push_str("+ ");
            out.push_str(&escape_literal(rule));
            out.push('\n');
        }
        for rule in &self.excludes {
            out.push_str("- ");
            out.push_str(rule);
            out.push('\n');
        }
        out
    }

    /// Host-side evaluation of the rules, for promoting a staging tree when
    /// rsync isn't available. `rel` is relative to the workspace root.
    pub fn is_excluded(&self, rel: &str, is_dir: bool) -> bool {
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            return false;
        }
        let anchored = if is_dir {
            format!("/{rel}/")
        } else {
            format!("/{rel}")
        };
        if self.includes.iter().any(|inc| *inc == anchored) {
            return false;
        }
        self.excludes
            .iter()
            .any(|pattern| pattern_matches(pattern, rel, is_dir))
    }
}

/// Make a literal path safe as an rsync pattern.
///
/// rsync only honors backslash escapes in patterns that contain a wildcard,
/// so paths without `*`, `?` or `[` are left untouched.
fn escape_literal(path: &str) -> String {
    if !path.contains(['*', '?', '[']) {
        return path.to_string();
    }
    let mut out = String::with_capacity(path.len() + 4);
    for c in path.chars() {
        if matches!(c, '\\' | '*' | '?' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(candidate, MATCH_OPTIONS),
        Err(_) => pattern == candidate,
    }
}

/// rsync-style matching of a single exclude pattern against a relative path.
fn pattern_matches(pattern: &str, rel: &str, is_dir: bool) -> bool {
    let (pattern, dir_only) = match pattern.strip_suffix('/') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    if dir_only && !is_dir {
        return false;
    }

    if let Some(anchored) = pattern.strip_prefix('/') {
        return glob_matches(anchored, rel);
    }

    if pattern.contains('/') {
        // Unanchored: may match any trailing run of whole components.
        return rel
            .char_indices()
            .filter(|&(i, c)| i == 0 || c == '/')
            .map(|(i, _)| if i == 0 { rel } else { &rel[i + 1..] })
            .any(|suffix| glob_matches(pattern, suffix));
    }

    let name = rel.rsplit('/').next().unwrap_or(rel);
    glob_matches(pattern, name)
}
