//! Scripted in-memory runtime for tests.
//!
//! Container paths under the mapped workspace resolve to a host directory,
//! so file copies behave like `docker cp` against a real container tree.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use tokio::io::DuplexStream;

use super::{
    ByteStream, ContainerRuntime, ContainerSummary, ExecOutput, ExecSpec, PtyHandle, PtySize,
};

pub type ChunkSender = mpsc::UnboundedSender<Result<Bytes>>;

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashSet<String>>,
    tools: Mutex<HashSet<String>>,
    installable: Mutex<Vec<(String, String)>>,
    branch: Mutex<String>,
    overrides: Mutex<Vec<(String, ExecOutput)>>,
    workspace: Mutex<Option<(String, PathBuf)>>,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<Bytes>>>>,
    ptys: Mutex<VecDeque<(mpsc::UnboundedReceiver<Result<Bytes>>, DuplexStream)>>,
    pub calls: Mutex<Vec<(String, ExecSpec)>>,
    pub resizes: Mutex<Vec<(String, PtySize)>>,
    pub uploads: Mutex<Vec<String>>,
    pub stream_opens: AtomicUsize,
    pub pty_opens: AtomicUsize,
    stalled_copies: AtomicBool,
    pty_delay: Mutex<Option<std::time::Duration>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self::default();
        *runtime.branch.lock().unwrap() = "main".to_string();
        runtime
    }

    pub fn add_container(&self, id: &str) {
        self.containers.lock().unwrap().insert(id.to_string());
    }

    pub fn add_tool(&self, tool: &str) {
        self.tools.lock().unwrap().insert(tool.to_string());
    }

    /// Package-manager installs of `package` will succeed and provide `tool`.
    pub fn allow_install(&self, package: &str, tool: &str) {
        self.installable
            .lock()
            .unwrap()
            .push((package.to_string(), tool.to_string()));
    }

    /// Copies out of the container never complete.
    pub fn stall_copies(&self) {
        self.stalled_copies.store(true, Ordering::SeqCst);
    }

    /// Opening a PTY takes `delay`.
    pub fn delay_pty(&self, delay: std::time::Duration) {
        *self.pty_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_branch(&self, branch: &str) {
        *self.branch.lock().unwrap() = branch.to_string();
    }

    /// Execs whose joined command line contains `needle` return `output`.
    pub fn respond(&self, needle: &str, output: ExecOutput) {
        self.overrides
            .lock()
            .unwrap()
            .push((needle.to_string(), output));
    }

    /// Map the container path `container_path` onto the host directory `host`.
    pub fn map_workspace(&self, container_path: &str, host: &Path) {
        *self.workspace.lock().unwrap() = Some((container_path.to_string(), host.to_path_buf()));
    }

    /// Queue an output stream for the next `exec_stream` call.
    pub fn prepare_stream(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    /// Queue a PTY for the next `open_pty` call. Returns the output feed and
    /// the far end of the PTY input.
    pub fn prepare_pty(&self) -> (ChunkSender, DuplexStream) {
        let (tx, rx) = mpsc::unbounded();
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.ptys.lock().unwrap().push_back((rx, near));
        (tx, far)
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, spec)| spec.cmd.join(" "))
            .collect()
    }

    fn resolve(&self, container_path: &str) -> Option<PathBuf> {
        let guard = self.workspace.lock().unwrap();
        let (prefix, host) = guard.as_ref()?;
        let rest = container_path.strip_prefix(prefix.as_str())?;
        let rest = rest.trim_start_matches('/').trim_end_matches('.');
        Some(host.join(rest))
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn fail(code: i64, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(from).map_err(std::io::Error::other)?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((container_id.to_string(), spec.clone()));
        let line = spec.cmd.join(" ");

        if let Some((_, output)) = self
            .overrides
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
        {
            return Ok(output.clone());
        }

        if let Some(tool) = line.strip_prefix("sh -c command -v ") {
            return Ok(if self.tools.lock().unwrap().contains(tool.trim()) {
                Self::ok(&format!("/usr/bin/{}\n", tool.trim()))
            } else {
                Self::fail(1, "")
            });
        }
        if line.contains("rev-parse --abbrev-ref HEAD") {
            return Ok(Self::ok(&format!("{}\n", self.branch.lock().unwrap())));
        }
        for manager in ["apt-get", "apk", "dnf", "yum"] {
            if line.contains(&format!("{manager} ")) {
                let installable = self.installable.lock().unwrap().clone();
                if let Some((_, tool)) = installable.iter().find(|(pkg, _)| line.contains(pkg.as_str())) {
                    self.tools.lock().unwrap().insert(tool.clone());
                    return Ok(Self::ok(""));
                }
                return Ok(Self::fail(127, &format!("{manager}: not found")));
            }
        }
        Ok(Self::ok(""))
    }

    async fn exec_stream(&self, container_id: &str, spec: ExecSpec) -> Result<ByteStream> {
        self.calls
            .lock()
            .unwrap()
            .push((container_id.to_string(), spec));
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        match self.streams.lock().unwrap().pop_front() {
            Some(rx) => Ok(rx.boxed()),
            None => anyhow::bail!("watcher unavailable"),
        }
    }

    async fn open_pty(
        &self,
        container_id: &str,
        _shell: &str,
        _working_dir: &str,
        size: PtySize,
    ) -> Result<PtyHandle> {
        let delay = *self.pty_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.pty_opens.fetch_add(1, Ordering::SeqCst);
        let (rx, input) = self
            .ptys
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no PTY prepared for {}", container_id))?;
        let exec_id = format!("exec-{}", self.pty_opens.load(Ordering::SeqCst));
        self.resizes.lock().unwrap().push((exec_id.clone(), size));
        Ok(PtyHandle {
            exec_id,
            output: rx.boxed(),
            input: Box::pin(input),
        })
    }

    async fn resize_pty(&self, exec_id: &str, size: PtySize) -> Result<()> {
        self.resizes
            .lock()
            .unwrap()
            .push((exec_id.to_string(), size));
        Ok(())
    }

    async fn copy_from_container(&self, _container_id: &str, src: &str, dest: &Path) -> Result<()> {
        if self.stalled_copies.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let from = self
            .resolve(src)
            .ok_or_else(|| anyhow::anyhow!("no such path in container: {}", src))?;
        copy_tree(&from, dest)?;
        Ok(())
    }

    async fn copy_to_container(&self, _container_id: &str, _src: &Path, dest: &str) -> Result<()> {
        self.uploads.lock().unwrap().push(dest.to_string());
        Ok(())
    }

    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        Ok(self.containers.lock().unwrap().contains(container_id))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let mut ids: Vec<String> = self.containers.lock().unwrap().iter().cloned().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .map(|id| ContainerSummary {
                name: format!("agent-{}", id),
                id,
                image: "agent:latest".to_string(),
                status: "Up".to_string(),
            })
            .collect())
    }
}
