use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::{ByteStream, ContainerRuntime, ContainerSummary, ExecOutput, ExecSpec, PtyHandle, PtySize};

/// Bounds every one-shot runtime call by a deadline.
///
/// Streams and PTYs live as long as their session, so only opening them is
/// bounded; reading from them is not.
pub struct TimeoutRuntime {
    inner: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl TimeoutRuntime {
    pub fn new(inner: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("{} timed out after {}s", what, self.timeout.as_secs_f32()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for TimeoutRuntime {
    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        let what = format!("exec `{}`", spec.cmd.join(" "));
        self.bounded(&what, self.inner.exec(container_id, spec)).await
    }

    async fn exec_stream(&self, container_id: &str, spec: ExecSpec) -> Result<ByteStream> {
        self.bounded("exec stream", self.inner.exec_stream(container_id, spec))
            .await
    }

    async fn open_pty(
        &self,
        container_id: &str,
        shell: &str,
        working_dir: &str,
        size: PtySize,
    ) -> Result<PtyHandle> {
        self.bounded(
            "opening PTY",
            self.inner.open_pty(container_id, shell, working_dir, size),
        )
        .await
    }

    async fn resize_pty(&self, exec_id: &str, size: PtySize) -> Result<()> {
        self.bounded("PTY resize", self.inner.resize_pty(exec_id, size))
            .await
    }

    async fn copy_from_container(&self, container_id: &str, src: &str, dest: &Path) -> Result<()> {
        let what = format!("copy of {src} from container");
        self.bounded(&what, self.inner.copy_from_container(container_id, src, dest))
            .await
    }

    async fn copy_to_container(&self, container_id: &str, src: &Path, dest: &str) -> Result<()> {
        let what = format!("copy to {dest} in container");
        self.bounded(&what, self.inner.copy_to_container(container_id, src, dest))
            .await
    }

    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        self.bounded("container inspect", self.inner.container_exists(container_id))
            .await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.bounded("container list", self.inner.list_containers())
            .await
    }
}
