//! Container access.
//!
//! Everything shadowbox does inside a container goes through the
//! [`ContainerRuntime`] trait: one-shot commands, long-running output streams
//! (the file watcher), the shared PTY, and file copies in both directions.
//! [`docker::DockerRuntime`] is the production implementation.

pub mod docker;
#[cfg(test)]
pub mod testing;
mod timeout;

pub use timeout::TimeoutRuntime;

use std::path::Path;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

/// Raw output chunks from a streaming exec or PTY.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Write half of a PTY.
pub type PtyInput = Pin<Box<dyn AsyncWrite + Send>>;

/// A command to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
}

impl ExecSpec {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Collected result of a one-shot exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout on success, an error carrying stderr otherwise.
    pub fn into_stdout(self) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            anyhow::bail!("exit code {}: {}", self.exit_code, self.stderr.trim())
        }
    }
}

/// Logical terminal size shared by every client of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// An interactive exec channel with a TTY attached.
pub struct PtyHandle {
    pub exec_id: String,
    pub output: ByteStream,
    pub input: PtyInput,
}

/// A running container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a command to completion and collect its output.
    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<ExecOutput>;

    /// Run a long-lived command and stream its stdout/stderr.
    async fn exec_stream(&self, container_id: &str, spec: ExecSpec) -> Result<ByteStream>;

    /// Open an interactive shell with a TTY.
    async fn open_pty(
        &self,
        container_id: &str,
        shell: &str,
        working_dir: &str,
        size: PtySize,
    ) -> Result<PtyHandle>;

    async fn resize_pty(&self, exec_id: &str, size: PtySize) -> Result<()>;

    /// Copy `src` inside the container to `dest` on the host (`docker cp` semantics).
    async fn copy_from_container(&self, container_id: &str, src: &str, dest: &Path) -> Result<()>;

    /// Copy the host file `src` to `dest` inside the container.
    async fn copy_to_container(&self, container_id: &str, src: &Path, dest: &str) -> Result<()>;

    /// Whether the container exists and is running.
    async fn container_exists(&self, container_id: &str) -> Result<bool>;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;
}

/// Whether `tool` is on the container's PATH.
pub async fn has_command(runtime: &dyn ContainerRuntime, container_id: &str, tool: &str) -> bool {
    match runtime
        .exec(container_id, ExecSpec::shell(format!("command -v {tool}")))
        .await
    {
        Ok(output) => output.success(),
        Err(_) => false,
    }
}

/// Branch currently checked out in the container's workspace, read live.
pub async fn container_branch(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    workspace: &str,
) -> Result<String> {
    let output = runtime
        .exec(
            container_id,
            ExecSpec::new([
                "git",
                "-c",
                "safe.directory=*",
                "-C",
                workspace,
                "rev-parse",
                "--abbrev-ref",
                "HEAD",
            ]),
        )
        .await?;
    let branch = output
        .into_stdout()
        .context("Failed to read container branch")?
        .trim()
        .to_string();
    if branch.is_empty() || branch == "HEAD" {
        anyhow::bail!("Container workspace has no checked-out branch");
    }
    Ok(branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testing::FakeRuntime;

    #[test]
    fn exec_spec_builders() {
        let spec = ExecSpec::shell("echo hi").user("root").working_dir("/workspace");
        assert_eq!(spec.cmd, vec!["sh", "-c", "echo hi"]);
        assert_eq!(spec.user.as_deref(), Some("root"));
        assert_eq!(spec.working_dir.as_deref(), Some("/workspace"));
    }

    #[test]
    fn exec_output_into_stdout() {
        let ok = ExecOutput {
            exit_code: 0,
            stdout: "main\n".into(),
            stderr: String::new(),
        };
        assert_eq!(ok.into_stdout().unwrap(), "main\n");

        let failed = ExecOutput {
            exit_code: 127,
            stdout: String::new(),
            stderr: "not found\n".into(),
        };
        let err = failed.into_stdout().unwrap_err();
        assert_eq!(err.to_string(), "exit code 127: not found");
    }

    #[tokio::test]
    async fn container_branch_reads_rev_parse() {
        let runtime = FakeRuntime::new();
        runtime.set_branch("feature/x");
        let branch = container_branch(&runtime, "c1", "/workspace").await.unwrap();
        assert_eq!(branch, "feature/x");
    }

    #[tokio::test]
    async fn container_branch_rejects_detached_head() {
        let runtime = FakeRuntime::new();
        runtime.set_branch("HEAD");
        assert!(container_branch(&runtime, "c1", "/workspace").await.is_err());
    }

    #[tokio::test]
    async fn has_command_reflects_exit_status() {
        let runtime = FakeRuntime::new();
        runtime.add_tool("rsync");
        assert!(has_command(&runtime, "c1", "rsync").await);
        assert!(!has_command(&runtime, "c1", "inotifywait").await);
    }
}
