use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use git2::Repository;

use crate::errors::ShadowError;

/// Run `git <args>` in `dir` and return stdout. The child is killed if it
/// outlives `timeout`.
pub async fn run(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, ShadowError> {
    let child = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(timeout, child).await {
        Ok(output) => output.with_context(|| format!("Failed to run git {}", args.join(" ")))?,
        Err(_) => {
            return Err(ShadowError::Timeout {
                command: format!("git {}", args.join(" ")),
                timeout,
            });
        }
    };

    if !output.status.success() {
        return Err(ShadowError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Paths in the repository's index, relative to the work tree.
pub fn tracked_files(repo_path: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;
    let index = repo.index().context("Failed to read git index")?;
    Ok(index
        .iter()
        .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
        .collect())
}

/// Checked-out branch name, including unborn branches.
pub fn current_branch(repo_path: &Path) -> Option<String> {
    let repo = Repository::open(repo_path).ok()?;
    let head = repo.find_reference("HEAD").ok()?;
    match head.symbolic_target() {
        Some(target) => target.strip_prefix("refs/heads/").map(str::to_string),
        None => None,
    }
}

/// URL of the named remote, if configured.
pub fn remote_url(repo_path: &Path, name: &str) -> Option<String> {
    let repo = Repository::open(repo_path).ok()?;
    let remote = repo.find_remote(name).ok()?;
    remote.url().map(str::to_string)
}

/// Whether HEAD resolves to a commit (false for unborn branches).
pub fn has_head(repo_path: &Path) -> bool {
    Repository::open(repo_path)
        .ok()
        .is_some_and(|repo| repo.head().ok().is_some_and(|h| h.peel_to_commit().is_ok()))
}
