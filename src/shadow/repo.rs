//! Per-session shadow repository.
//!
//! A host-side clone of the user's repository whose working tree mirrors a
//! container's workspace. The container is always the source of truth: every
//! sync rebuilds the tree from it and stages the result, so diffs, commits and
//! pushes happen here and never in the user's checkout.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::diff::{ChangeSummary, DiffData, DiffStats, new_files};
use super::git;
use super::rules::RuleSet;
use super::transport::{self, Transport, sh_quote};
use crate::config::{GitSettings, Settings, SyncSettings};
use crate::container::{ContainerRuntime, ExecSpec, container_branch};
use crate::errors::{GitWorkflowError, ShadowError};
use crate::fallback::first_success;

const CLEANUP_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Ways to populate the shadow working tree, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneStrategy {
    Shallow,
    Full,
    FilesystemCopy,
}

impl CloneStrategy {
    pub const ALL: [CloneStrategy; 3] = [
        CloneStrategy::Shallow,
        CloneStrategy::Full,
        CloneStrategy::FilesystemCopy,
    ];
}

impl fmt::Display for CloneStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneStrategy::Shallow => write!(f, "shallow-clone"),
            CloneStrategy::Full => write!(f, "full-clone"),
            CloneStrategy::FilesystemCopy => write!(f, "filesystem-copy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchSwitch {
    TrackRemote,
    Local,
    Create,
}

impl BranchSwitch {
    const ALL: [BranchSwitch; 3] = [BranchSwitch::TrackRemote, BranchSwitch::Local, BranchSwitch::Create];
}

impl fmt::Display for BranchSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchSwitch::TrackRemote => write!(f, "track-remote"),
            BranchSwitch::Local => write!(f, "local"),
            BranchSwitch::Create => write!(f, "create"),
        }
    }
}

/// Working-tree state relative to HEAD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub has_changes: bool,
    pub summary: ChangeSummary,
    pub status: String,
}

/// Short session identifier derived from a container id.
pub fn session_id(container_id: &str) -> String {
    container_id.chars().take(12).collect()
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ShadowError + '_ {
    move |source| ShadowError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub struct ShadowRepository {
    container_id: String,
    session: String,
    original: PathBuf,
    path: PathBuf,
    rules_path: PathBuf,
    target_branch: Option<String>,
    state: RepoState,
    sync: SyncSettings,
    identity: GitSettings,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ShadowRepository {
    pub fn new(container_id: &str, settings: &Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let session = session_id(container_id);
        let root = &settings.sync.temp_root;
        Self {
            container_id: container_id.to_string(),
            path: root.join(&session),
            rules_path: root.join(format!("{session}.rules")),
            session,
            original: settings.repo_path.clone(),
            target_branch: settings.target_branch.clone(),
            state: RepoState::Uninitialized,
            sync: settings.sync.clone(),
            identity: settings.git.clone(),
            runtime,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rules_path(&self) -> &Path {
        &self.rules_path
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn state(&self) -> RepoState {
        self.state
    }

    /// Whether the repository metadata is still on disk.
    pub fn is_present(&self) -> bool {
        self.path.join(".git").is_dir()
    }

    pub fn current_branch(&self) -> Option<String> {
        git::current_branch(&self.path)
    }

    /// Populate the shadow repository from the original and commit a baseline.
    pub async fn initialize(&mut self) -> Result<CloneStrategy, ShadowError> {
        self.state = RepoState::Initializing;
        match self.populate().await {
            Ok(strategy) => {
                self.state = RepoState::Ready;
                info!(session = %self.session, strategy = %strategy, path = %self.path.display(), "shadow repository ready");
                Ok(strategy)
            }
            Err(e) => {
                self.state = RepoState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn populate(&self) -> Result<CloneStrategy, ShadowError> {
        let root = &self.sync.temp_root;
        std::fs::create_dir_all(root).map_err(io_error(root))?;
        remove_path(&self.path).map_err(io_error(&self.path))?;

        let source_branch =
            git::current_branch(&self.original).unwrap_or_else(|| "main".to_string());
        let branch = source_branch.as_str();
        let (strategy, ()) = first_success(&CloneStrategy::ALL, |strategy| {
            self.try_populate(strategy, branch)
        })
        .await
        .map_err(ShadowError::Initialization)?;

        if let Some(target) = &self.target_branch
            && *target != source_branch
        {
            self.git(&self.path, &["checkout", "-b", target]).await?;
        }

        self.configure_origin().await?;
        self.configure_identity().await?;

        if !git::has_head(&self.path) {
            self.git(
                &self.path,
                &["commit", "--allow-empty", "--no-verify", "-m", "Initial commit"],
            )
            .await?;
        }
        self.baseline_commit().await?;
        Ok(strategy)
    }

    async fn try_populate(&self, strategy: CloneStrategy, branch: &str) -> anyhow::Result<()> {
        remove_path(&self.path)?;
        let root = &self.sync.temp_root;
        let dest = self.path.to_string_lossy();
        match strategy {
            CloneStrategy::Shallow => {
                let url = format!("file://{}", self.original.display());
                self.git(
                    root,
                    &["clone", "--depth", "1", "--single-branch", "--branch", branch, &url, &dest],
                )
                .await?;
            }
            CloneStrategy::Full => {
                let source = self.original.to_string_lossy();
                self.git(
                    root,
                    &["clone", "--single-branch", "--branch", branch, &source, &dest],
                )
                .await?;
            }
            CloneStrategy::FilesystemCopy => {
                copy_worktree(&self.original, &self.path)?;
                self.git(&self.path, &["init", "-q"]).await?;
                self.git(
                    &self.path,
                    &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")],
                )
                .await?;
                self.configure_identity().await?;
                self.git(&self.path, &["add", "-A"]).await?;
                self.force_add_tracked()?;
                self.git(
                    &self.path,
                    &["commit", "--allow-empty", "--no-verify", "-q", "-m", "Initial snapshot"],
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Stage files the original tracks even when `.gitignore` would skip them.
    fn force_add_tracked(&self) -> anyhow::Result<()> {
        let Ok(tracked) = git::tracked_files(&self.original) else {
            return Ok(());
        };
        let repo = git2::Repository::open(&self.path).context("Failed to open shadow repository")?;
        let mut index = repo.index()?;
        for file in tracked {
            if self.path.join(&file).is_file() {
                index.add_path(Path::new(&file))?;
            }
        }
        index.write()?;
        Ok(())
    }

    async fn configure_origin(&self) -> Result<(), ShadowError> {
        let has_origin = git::remote_url(&self.path, "origin").is_some();
        match git::remote_url(&self.original, "origin") {
            Some(url) if has_origin => {
                self.git(&self.path, &["remote", "set-url", "origin", &url]).await?;
            }
            Some(url) => {
                self.git(&self.path, &["remote", "add", "origin", &url]).await?;
            }
            None if has_origin => {
                self.git(&self.path, &["remote", "remove", "origin"]).await?;
            }
            None => {}
        }
        Ok(())
    }

    async fn configure_identity(&self) -> Result<(), ShadowError> {
        self.git(&self.path, &["config", "user.name", &self.identity.author_name]).await?;
        self.git(&self.path, &["config", "user.email", &self.identity.author_email]).await?;
        Ok(())
    }

    /// Switch to the branch checked out in the container, if it differs.
    ///
    /// Returns the new branch when a switch happened.
    pub async fn reset_to_container_branch(&self) -> Result<Option<String>, ShadowError> {
        self.ensure_ready()?;
        let branch = container_branch(
            self.runtime.as_ref(),
            &self.container_id,
            &self.sync.container_path,
        )
        .await?;
        if self.current_branch().as_deref() == Some(branch.as_str()) {
            return Ok(None);
        }

        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        if let Err(e) = self.git(&self.path, &["fetch", "origin", &refspec]).await {
            debug!(session = %self.session, branch = %branch, error = %e, "fetch failed, trying local branches");
        }

        let path = self.path.as_path();
        let branch_ref = branch.as_str();
        let timeout = self.sync.command_timeout;
        let (how, ()) = first_success(&BranchSwitch::ALL, |how| async move {
            let remote = format!("origin/{branch_ref}");
            let args: Vec<&str> = match how {
                BranchSwitch::TrackRemote => vec!["checkout", "-f", "-B", branch_ref, remote.as_str()],
                BranchSwitch::Local => vec!["checkout", "-f", branch_ref],
                BranchSwitch::Create => vec!["checkout", "-f", "-b", branch_ref],
            };
            git::run(path, &args, timeout).await?;
            anyhow::Ok(())
        })
        .await
        .map_err(|e| {
            ShadowError::Other(anyhow::Error::new(e).context(format!("Failed to switch to {branch}")))
        })?;

        info!(session = %self.session, branch = %branch, strategy = %how, "shadow repository switched branch");
        Ok(Some(branch))
    }

    /// Mirror the container workspace into the working tree and stage it.
    pub async fn sync_from_container(&self) -> Result<Transport, ShadowError> {
        self.ensure_ready()?;
        let rules = RuleSet::for_repo(&self.path);
        std::fs::write(&self.rules_path, rules.to_filter_rules())
            .map_err(io_error(&self.rules_path))?;

        let runtime = self.runtime.as_ref();
        transport::fix_ownership(
            runtime,
            &self.container_id,
            &self.sync.container_path,
            &self.sync.container_user,
        )
        .await;

        let transport = transport::select_transport(runtime, &self.container_id).await;
        match transport {
            Transport::Rsync => self.sync_via_rsync().await?,
            Transport::DockerCp => self.sync_via_copy(&rules).await?,
        }

        self.git(&self.path, &["add", "-A"]).await?;
        debug!(session = %self.session, transport = %transport, "synced from container");
        Ok(transport)
    }

    fn staging_dir(&self) -> String {
        format!("/tmp/shadowbox-{}", self.session)
    }

    async fn sync_via_rsync(&self) -> Result<(), ShadowError> {
        let runtime = self.runtime.as_ref();
        let staging = self.staging_dir();
        let remote_rules = format!("{staging}.rules");

        runtime
            .copy_to_container(&self.container_id, &self.rules_path, &remote_rules)
            .await
            .context("Failed to upload rsync rules")?;

        let script = format!(
            "rm -rf {st} && mkdir -p {st} && rsync -a --delete --filter={merge} {src}/ {st}/",
            st = sh_quote(&staging),
            merge = sh_quote(&format!("merge {remote_rules}")),
            src = sh_quote(&self.sync.container_path),
        );
        runtime
            .exec(&self.container_id, ExecSpec::shell(script).user("root"))
            .await?
            .into_stdout()
            .context("rsync into staging failed")?;

        clear_worktree(&self.path).map_err(io_error(&self.path))?;
        let pulled = runtime
            .copy_from_container(&self.container_id, &format!("{staging}/."), &self.path)
            .await
            .context("Failed to copy staging directory");

        let cleanup = format!("rm -rf {} {}", sh_quote(&staging), sh_quote(&remote_rules));
        if let Err(e) = runtime
            .exec(&self.container_id, ExecSpec::shell(cleanup).user("root"))
            .await
        {
            debug!(session = %self.session, error = %e, "staging cleanup failed");
        }
        pulled?;
        Ok(())
    }

    async fn sync_via_copy(&self, rules: &RuleSet) -> Result<(), ShadowError> {
        let root = &self.sync.temp_root;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-stage-", self.session))
            .tempdir_in(root)
            .map_err(io_error(root))?;

        self.runtime
            .copy_from_container(
                &self.container_id,
                &format!("{}/.", self.sync.container_path),
                staging.path(),
            )
            .await
            .context("docker cp from container failed")?;

        if self.sync.host_rsync && transport::host_has_rsync().await {
            self.promote_with_rsync(staging.path()).await?;
        } else {
            clear_worktree(&self.path).map_err(io_error(&self.path))?;
            promote(staging.path(), &self.path, rules).map_err(io_error(&self.path))?;
        }
        Ok(())
    }

    async fn promote_with_rsync(&self, staging: &Path) -> Result<(), ShadowError> {
        let timeout = self.sync.command_timeout;
        let rsync = tokio::process::Command::new("rsync")
            .arg("-a")
            .arg("--delete")
            .arg(format!("--filter=merge {}", self.rules_path.display()))
            .arg(format!("{}/", staging.display()))
            .arg(format!("{}/", self.path.display()))
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, rsync)
            .await
            .map_err(|_| ShadowError::Timeout {
                command: "host rsync".to_string(),
                timeout,
            })?
            .context("Failed to run host rsync")?;
        if !output.status.success() {
            return Err(ShadowError::Other(anyhow::anyhow!(
                "host rsync failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Whether the tree differs from HEAD, with per-class counts.
    pub async fn get_changes(&self) -> Result<Changes, ShadowError> {
        self.ensure_ready()?;
        let status = self.git(
            &self.path,
            &["-c", "core.quotepath=off", "status", "--porcelain"],
        )
        .await?;
        Ok(Changes {
            has_changes: !status.trim().is_empty(),
            summary: ChangeSummary::from_porcelain(&status),
            status,
        })
    }

    /// Staged diff against HEAD plus stats and the list of new files.
    pub async fn diff(&self) -> Result<DiffData, ShadowError> {
        let changes = self.get_changes().await?;
        let diff = if git::has_head(&self.path) {
            self.git(&self.path, &["diff", "--cached", "HEAD"]).await?
        } else {
            self.git(&self.path, &["diff", "--cached"]).await?
        };
        Ok(DiffData {
            untracked_files: new_files(&changes.status),
            stats: DiffStats::from_diff(&diff),
            status: changes.status,
            diff,
        })
    }

    /// Stage and commit everything so later diffs only show new edits.
    /// Returns false when there was nothing to commit.
    pub async fn baseline_commit(&self) -> Result<bool, ShadowError> {
        self.git(&self.path, &["add", "-A"]).await?;
        let status = self.git(&self.path, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        self.git(
            &self.path,
            &["commit", "--no-verify", "-q", "-m", "Baseline snapshot"],
        )
        .await?;
        debug!(session = %self.session, "baseline commit created");
        Ok(true)
    }

    /// Commit all staged changes. Returns the short hash of the new commit.
    pub async fn commit(&self, message: &str) -> Result<String, GitWorkflowError> {
        self.ensure_ready()?;
        self.git(&self.path, &["add", "-A"]).await?;
        if !self.get_changes().await?.has_changes {
            return Err(GitWorkflowError::NothingToCommit);
        }
        self.git(&self.path, &["commit", "-m", message])
            .await
            .map_err(|e| match e {
                ShadowError::Git { stderr, .. } => GitWorkflowError::CommitFailed(stderr),
                other => other.into(),
            })?;
        let sha = self.git(&self.path, &["rev-parse", "--short", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    /// Push to `origin`, switching to `branch` first when given. Returns the
    /// branch that was pushed.
    pub async fn push(&self, branch: Option<&str>) -> Result<String, GitWorkflowError> {
        self.ensure_ready()?;
        if git::remote_url(&self.path, "origin").is_none() {
            return Err(GitWorkflowError::NoRemote);
        }

        let current = self.current_branch();
        let branch = match branch.map(str::trim).filter(|b| !b.is_empty()) {
            Some(b) => b.to_string(),
            None => current.clone().ok_or(ShadowError::NotReady)?,
        };
        if current.as_deref() != Some(branch.as_str()) {
            self.git(&self.path, &["checkout", "-B", &branch]).await?;
        }

        self.git(&self.path, &["push", "-u", "origin", &branch])
            .await
            .map_err(|e| match e {
                ShadowError::Git { stderr, .. } => GitWorkflowError::PushFailed(stderr),
                other => other.into(),
            })?;
        info!(session = %self.session, branch = %branch, "pushed shadow repository");
        Ok(branch)
    }

    /// Remove the working tree and rule file. Non-fatal; returns whether
    /// everything was removed.
    pub async fn cleanup(&mut self) -> bool {
        self.state = RepoState::Uninitialized;
        for attempt in 1..=CLEANUP_ATTEMPTS {
            let result = remove_path(&self.path).and_then(|_| remove_path(&self.rules_path));
            match result {
                Ok(()) => return true,
                Err(e) => {
                    debug!(session = %self.session, attempt, error = %e, "cleanup attempt failed");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
        }
        warn!(session = %self.session, path = %self.path.display(), "could not remove shadow repository");
        false
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, ShadowError> {
        git::run(dir, args, self.sync.command_timeout).await
    }

    fn ensure_ready(&self) -> Result<(), ShadowError> {
        if self.state == RepoState::Ready {
            Ok(())
        } else {
            Err(ShadowError::NotReady)
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete everything in `root` except `.git`.
fn clear_worktree(root: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        remove_path(&entry.path())?;
    }
    Ok(())
}

fn copy_entry(entry: &walkdir::DirEntry, target: &Path) -> std::io::Result<()> {
    let file_type = entry.file_type();
    if file_type.is_dir() {
        return std::fs::create_dir_all(target);
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if file_type.is_symlink() {
        let link = std::fs::read_link(entry.path())?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(link, target)?;
        #[cfg(not(unix))]
        let _ = link;
        return Ok(());
    }
    std::fs::copy(entry.path(), target).map(|_| ())
}

/// Copy `from` into `to`, applying `rules` to paths relative to `from`.
fn promote(from: &Path, to: &Path, rules: &RuleSet) -> std::io::Result<()> {
    let walker = WalkDir::new(from).min_depth(1).into_iter().filter_entry(|entry| {
        let rel = entry
            .path()
            .strip_prefix(from)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        !rules.is_excluded(&rel, entry.file_type().is_dir())
    });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(from).map_err(std::io::Error::other)?;
        copy_entry(&entry, &to.join(rel))?;
    }
    Ok(())
}

/// Plain copy of a working tree, skipping VCS metadata and dependencies.
fn copy_worktree(from: &Path, to: &Path) -> anyhow::Result<()> {
    if !from.is_dir() {
        anyhow::bail!("{} is not a directory", from.display());
    }
    std::fs::create_dir_all(to)?;
    promote(from, to, &RuleSet::fallback())
        .with_context(|| format!("Failed to copy {}", from.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testing::FakeRuntime;
    use crate::shadow::git::fixtures::{commit_files, init_repo};
    use std::fs;
    use std::process::Command;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        original: TempDir,
        container: TempDir,
        temp_root: TempDir,
        runtime: Arc<FakeRuntime>,
    }

    impl Fixture {
        fn new() -> Self {
            let original = tempdir().unwrap();
            init_repo(original.path(), "main");
            let container = tempdir().unwrap();
            let runtime = Arc::new(FakeRuntime::new());
            runtime.add_container("c0ffee1234567890");
            runtime.map_workspace("/workspace", container.path());
            Self {
                original,
                container,
                temp_root: tempdir().unwrap(),
                runtime,
            }
        }

        fn settings(&self) -> Settings {
            let mut settings = Settings::new(self.original.path());
            settings.sync.temp_root = self.temp_root.path().to_path_buf();
            settings.sync.host_rsync = false;
            settings
        }

        fn repo(&self) -> ShadowRepository {
            self.repo_with(self.settings())
        }

        fn repo_with(&self, settings: Settings) -> ShadowRepository {
            ShadowRepository::new("c0ffee1234567890", &settings, self.runtime.clone())
        }

        fn container_write(&self, rel: &str, content: &str) {
            let path = self.container.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        /// Start the container as a copy of the original's working tree.
        fn seed_container(&self) {
            for entry in WalkDir::new(self.original.path()).min_depth(1) {
                let entry = entry.unwrap();
                let rel = entry.path().strip_prefix(self.original.path()).unwrap();
                if rel.starts_with(".git") {
                    continue;
                }
                let target = self.container.path().join(rel);
                if entry.file_type().is_dir() {
                    fs::create_dir_all(target).unwrap();
                } else {
                    fs::copy(entry.path(), target).unwrap();
                }
            }
        }
    }

    fn git_cli(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    #[test]
    fn test_session_id_truncates() {
        assert_eq!(session_id("c0ffee1234567890abcdef"), "c0ffee123456");
        assert_eq!(session_id("short"), "short");
    }

    #[test]
    fn test_paths_live_under_temp_root() {
        let fx = Fixture::new();
        let repo = fx.repo();
        assert_eq!(repo.path(), fx.temp_root.path().join("c0ffee123456"));
        assert_eq!(
            repo.rules_path(),
            fx.temp_root.path().join("c0ffee123456.rules")
        );
        assert_eq!(repo.state(), RepoState::Uninitialized);
    }

    #[tokio::test]
    async fn test_initialize_shallow_clone() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("README.md", "hello")], "init");

        let mut repo = fx.repo();
        let strategy = repo.initialize().await.unwrap();

        assert_eq!(strategy, CloneStrategy::Shallow);
        assert_eq!(repo.state(), RepoState::Ready);
        assert!(repo.path().join("README.md").exists());
        assert_eq!(repo.current_branch().as_deref(), Some("main"));
        assert!(git::remote_url(repo.path(), "origin").is_none());
        assert!(!repo.get_changes().await.unwrap().has_changes);
    }

    #[tokio::test]
    async fn test_initialize_points_origin_at_real_remote() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("README.md", "hello")], "init");
        git_cli(
            fx.original.path(),
            &["remote", "add", "origin", "https://github.com/acme/widgets.git"],
        );

        let mut repo = fx.repo();
        repo.initialize().await.unwrap();
        assert_eq!(
            git::remote_url(repo.path(), "origin").as_deref(),
            Some("https://github.com/acme/widgets.git")
        );
    }

    #[tokio::test]
    async fn test_initialize_creates_target_branch() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("README.md", "hello")], "init");
        let mut settings = fx.settings();
        settings.target_branch = Some("agent/work".into());

        let mut repo = fx.repo_with(settings);
        repo.initialize().await.unwrap();
        assert_eq!(repo.current_branch().as_deref(), Some("agent/work"));
    }

    #[tokio::test]
    async fn test_initialize_falls_back_to_filesystem_copy() {
        let fx = Fixture::new();
        // Unborn branch: both clone strategies fail.
        fs::write(fx.original.path().join("notes.txt"), "draft").unwrap();

        let mut repo = fx.repo();
        let strategy = repo.initialize().await.unwrap();
        assert_eq!(strategy, CloneStrategy::FilesystemCopy);
        assert!(repo.path().join("notes.txt").exists());
        assert!(git::has_head(repo.path()));
    }

    #[tokio::test]
    async fn test_initialize_purges_stale_directory() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("README.md", "hello")], "init");
        let stale = fx.temp_root.path().join("c0ffee123456");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("leftover.txt"), "old").unwrap();

        let mut repo = fx.repo();
        repo.initialize().await.unwrap();
        assert!(!repo.path().join("leftover.txt").exists());
    }

    #[tokio::test]
    async fn test_initialize_reports_every_failed_strategy() {
        let fx = Fixture::new();
        let mut settings = fx.settings();
        settings.repo_path = fx.temp_root.path().join("does-not-exist");

        let mut repo = fx.repo_with(settings);
        let err = repo.initialize().await.unwrap_err();
        match err {
            ShadowError::Initialization(exhausted) => {
                assert_eq!(exhausted.attempts.len(), 3);
                assert_eq!(exhausted.attempts[2].strategy, "filesystem-copy");
            }
            other => panic!("Expected Initialization, got {other:?}"),
        }
        assert_eq!(repo.state(), RepoState::Uninitialized);
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let fx = Fixture::new();
        let repo = fx.repo();
        assert!(matches!(
            repo.sync_from_container().await,
            Err(ShadowError::NotReady)
        ));
        assert!(matches!(repo.get_changes().await, Err(ShadowError::NotReady)));
    }

    #[tokio::test]
    async fn test_tracked_file_survives_gitignore() {
        let fx = Fixture::new();
        fs::write(fx.original.path().join(".gitignore"), "*.zip\n*.tar.gz\n").unwrap();
        commit_files(
            fx.original.path(),
            &[("data.zip", "zip"), ("corpus.tar.gz", "tgz"), ("src/lib.rs", "fn a() {}")],
            "init",
        );
        fx.seed_container();
        fx.container_write("scratch.zip", "untracked and ignored");
        fx.container_write("node_modules/pkg/index.js", "dep");

        let mut repo = fx.repo();
        repo.initialize().await.unwrap();
        let transport = repo.sync_from_container().await.unwrap();

        assert_eq!(transport, Transport::DockerCp);
        assert!(repo.path().join("data.zip").exists());
        assert!(repo.path().join("corpus.tar.gz").exists());
        assert!(repo.path().join("src/lib.rs").exists());
        assert!(!repo.path().join("scratch.zip").exists());
        assert!(!repo.path().join("node_modules").exists());
        assert!(repo.path().join(".git").is_dir());
        assert!(!repo.get_changes().await.unwrap().has_changes);
    }

    #[tokio::test]
    async fn test_host_rsync_promotion_honors_rules() {
        if !transport::host_has_rsync().await {
            eprintln!("rsync not installed on host, skipping");
            return;
        }
        let fx = Fixture::new();
        fs::write(fx.original.path().join(".gitignore"), "*.zip\n").unwrap();
        commit_files(
            fx.original.path(),
            &[("data.zip", "zip"), ("a[1].txt", "bracket"), ("old.txt", "old")],
            "init",
        );
        fx.seed_container();
        fx.container_write("scratch.zip", "untracked and ignored");
        fx.container_write("node_modules/pkg/index.js", "dep");
        fx.container_write("new.txt", "agent");
        fs::remove_file(fx.container.path().join("old.txt")).unwrap();

        let mut settings = fx.settings();
        settings.sync.host_rsync = true;
        let mut repo = fx.repo_with(settings);
        repo.initialize().await.unwrap();
        let transport = repo.sync_from_container().await.unwrap();

        assert_eq!(transport, Transport::DockerCp);
        assert!(repo.path().join("data.zip").exists());
        assert!(repo.path().join("a[1].txt").exists());
        assert!(repo.path().join("new.txt").exists());
        assert!(!repo.path().join("old.txt").exists());
        assert!(!repo.path().join("scratch.zip").exists());
        assert!(!repo.path().join("node_modules").exists());
        assert!(repo.is_present());

        let diff = repo.diff().await.unwrap();
        assert_eq!(diff.untracked_files, vec!["new.txt"]);
        assert_eq!(repo.get_changes().await.unwrap().summary.deleted, 1);
    }

    #[tokio::test]
    async fn test_sync_detects_added_modified_and_deleted() {
        let fx = Fixture::new();
        commit_files(
            fx.original.path(),
            &[("keep.txt", "same"), ("edit.txt", "before\n"), ("gone.txt", "bye")],
            "init",
        );
        fx.seed_container();
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();

        fx.container_write("new.txt", "hi\n");
        fx.container_write("edit.txt", "after\n");
        fs::remove_file(fx.container.path().join("gone.txt")).unwrap();
        repo.sync_from_container().await.unwrap();

        let changes = repo.get_changes().await.unwrap();
        assert!(changes.has_changes);
        assert_eq!(
            changes.summary,
            ChangeSummary {
                modified: 1,
                added: 1,
                deleted: 1
            }
        );

        let diff = repo.diff().await.unwrap();
        assert_eq!(diff.untracked_files, vec!["new.txt"]);
        assert_eq!(diff.stats.files, 3);
        assert!(diff.diff.contains("+after"));
    }

    #[tokio::test]
    async fn test_second_sync_without_changes_is_clean() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("a.txt", "a")], "init");
        fx.seed_container();
        fx.container_write("b.txt", "b");
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();

        repo.sync_from_container().await.unwrap();
        assert!(repo.baseline_commit().await.unwrap());
        repo.sync_from_container().await.unwrap();
        assert!(!repo.get_changes().await.unwrap().has_changes);
        assert!(!repo.baseline_commit().await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_writes_rule_file() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("data.zip", "zip")], "init");
        fx.seed_container();
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();
        repo.sync_from_container().await.unwrap();

        let rules = fs::read_to_string(repo.rules_path()).unwrap();
        assert!(rules.starts_with("+ /data.zip\n"));
        assert!(rules.contains("- .git/\n"));
    }

    #[tokio::test]
    async fn test_sync_via_rsync_pulls_staging_dir() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("a.txt", "a")], "init");
        fx.runtime.add_tool("rsync");
        // The fake has no rsync; stand the staging dir in for its output.
        let staging = tempdir().unwrap();
        fs::write(staging.path().join("a.txt"), "a").unwrap();
        fs::write(staging.path().join("from-rsync.txt"), "r").unwrap();
        fx.runtime.map_workspace("/tmp/shadowbox-c0ffee123456", staging.path());

        let mut repo = fx.repo();
        repo.initialize().await.unwrap();
        let transport = repo.sync_from_container().await.unwrap();

        assert_eq!(transport, Transport::Rsync);
        assert!(repo.path().join("from-rsync.txt").exists());
        assert_eq!(
            *fx.runtime.uploads.lock().unwrap(),
            vec!["/tmp/shadowbox-c0ffee123456.rules".to_string()]
        );
        let commands = fx.runtime.commands();
        assert!(commands.iter().any(|c| c.contains(
            "rsync -a --delete --filter='merge /tmp/shadowbox-c0ffee123456.rules' '/workspace'/"
        )));
        assert!(
            commands
                .iter()
                .any(|c| c.starts_with("sh -c rm -rf") && !c.contains("rsync"))
        );
    }

    #[tokio::test]
    async fn test_commit_flow() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("a.txt", "a")], "init");
        fx.seed_container();
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();

        assert!(matches!(
            repo.commit("nothing").await,
            Err(GitWorkflowError::NothingToCommit)
        ));

        fx.container_write("new.txt", "new");
        repo.sync_from_container().await.unwrap();
        let sha = repo.commit("add file").await.unwrap();
        assert!(!sha.is_empty());
        assert!(!repo.get_changes().await.unwrap().has_changes);
    }

    #[tokio::test]
    async fn test_push_without_remote() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("a.txt", "a")], "init");
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();

        let err = repo.push(Some("feature")).await.unwrap_err();
        assert!(matches!(err, GitWorkflowError::NoRemote));
        assert!(err.to_string().contains("No remote"));
    }

    fn original_with_bare_remote(fx: &Fixture, bare: &Path) {
        git_cli(bare, &["init", "--bare", "-q"]);
        commit_files(fx.original.path(), &[("a.txt", "a")], "init");
        let bare_path = bare.to_string_lossy().to_string();
        git_cli(fx.original.path(), &["remote", "add", "origin", &bare_path]);
        git_cli(fx.original.path(), &["push", "-q", "origin", "main"]);
    }

    #[tokio::test]
    async fn test_push_to_new_branch() {
        let fx = Fixture::new();
        let bare = tempdir().unwrap();
        original_with_bare_remote(&fx, bare.path());
        fx.seed_container();
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();

        fx.container_write("feature.txt", "f");
        repo.sync_from_container().await.unwrap();
        repo.commit("feature work").await.unwrap();
        let pushed = repo.push(Some("agent/feature")).await.unwrap();

        assert_eq!(pushed, "agent/feature");
        let remote = git2::Repository::open_bare(bare.path()).unwrap();
        assert!(remote.find_branch("agent/feature", git2::BranchType::Local).is_ok());
    }

    #[tokio::test]
    async fn test_reset_to_container_branch_tracks_origin() {
        let fx = Fixture::new();
        let bare = tempdir().unwrap();
        original_with_bare_remote(&fx, bare.path());
        git_cli(fx.original.path(), &["checkout", "-q", "-b", "feature"]);
        commit_files(fx.original.path(), &[("b.txt", "from feature")], "feature");
        git_cli(fx.original.path(), &["push", "-q", "origin", "feature"]);
        git_cli(fx.original.path(), &["checkout", "-q", "main"]);

        let mut repo = fx.repo();
        repo.initialize().await.unwrap();
        assert_eq!(repo.current_branch().as_deref(), Some("main"));

        fx.runtime.set_branch("feature");
        let switched = repo.reset_to_container_branch().await.unwrap();
        assert_eq!(switched.as_deref(), Some("feature"));
        assert_eq!(repo.current_branch().as_deref(), Some("feature"));
        assert_eq!(
            fs::read_to_string(repo.path().join("b.txt")).unwrap(),
            "from feature"
        );

        // Already there: nothing to do.
        assert_eq!(repo.reset_to_container_branch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_creates_branch_unknown_to_origin() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("a.txt", "a")], "init");
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();

        fx.runtime.set_branch("brand-new");
        repo.reset_to_container_branch().await.unwrap();
        assert_eq!(repo.current_branch().as_deref(), Some("brand-new"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_tree_and_rules() {
        let fx = Fixture::new();
        commit_files(fx.original.path(), &[("a.txt", "a")], "init");
        fx.seed_container();
        let mut repo = fx.repo();
        repo.initialize().await.unwrap();
        repo.sync_from_container().await.unwrap();
        assert!(repo.rules_path().exists());

        assert!(repo.cleanup().await);
        assert!(!repo.path().exists());
        assert!(!repo.rules_path().exists());
        assert!(!repo.is_present());
        assert_eq!(repo.state(), RepoState::Uninitialized);
    }

    #[test]
    fn test_promote_applies_rules() {
        let from = tempdir().unwrap();
        let to = tempdir().unwrap();
        fs::create_dir_all(from.path().join("node_modules/x")).unwrap();
        fs::write(from.path().join("node_modules/x/i.js"), "").unwrap();
        fs::write(from.path().join("keep.zip"), "").unwrap();
        fs::write(from.path().join("drop.zip"), "").unwrap();

        let rules = RuleSet::build(&["keep.zip"], Some("*.zip\n"));
        promote(from.path(), to.path(), &rules).unwrap();

        assert!(to.path().join("keep.zip").exists());
        assert!(!to.path().join("drop.zip").exists());
        assert!(!to.path().join("node_modules").exists());
    }
}
