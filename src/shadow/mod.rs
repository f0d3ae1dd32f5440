//! Shadow repositories: host-side git clones mirroring container workspaces.
//!
//! - `rules` builds the include/exclude set that decides which files are mirrored
//! - `git` wraps the git CLI and a few `git2` lookups
//! - `diff` turns status and diff output into summaries and stats
//! - `transport` picks how files leave the container
//! - `repo` owns one shadow repository per session

pub mod diff;
pub mod git;
pub mod repo;
pub mod rules;
pub mod transport;

pub use diff::{ChangeSummary, DiffData, DiffStats};
pub use repo::{Changes, CloneStrategy, RepoState, ShadowRepository, session_id};
pub use rules::RuleSet;
pub use transport::Transport;
