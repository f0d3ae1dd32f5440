use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::{
    DownloadFromContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    UploadToContainerOptionsBuilder,
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{
    ByteStream, ContainerRuntime, ContainerSummary, ExecOutput, ExecSpec, PtyHandle, PtySize,
};

/// [`ContainerRuntime`] backed by the local Docker daemon.
///
/// Everything goes through the Engine API; file copies travel as tar archives.
pub struct DockerRuntime {
    docker: Docker,
    prefix: Option<String>,
}

impl DockerRuntime {
    pub fn connect(prefix: Option<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker, prefix })
    }

    async fn start_attached(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
        tty: bool,
    ) -> Result<(String, StartExecResults)> {
        let exec = self
            .docker
            .create_exec(container_id, options)
            .await
            .with_context(|| format!("Failed to create exec in container {}", container_id))?;
        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to start exec in container {}", container_id))?;
        Ok((exec.id, started))
    }
}

fn exec_options(spec: &ExecSpec) -> CreateExecOptions<String> {
    CreateExecOptions {
        cmd: Some(spec.cmd.clone()),
        user: spec.user.clone(),
        working_dir: spec.working_dir.clone(),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    }
}

fn into_byte_stream(
    output: impl futures::Stream<Item = Result<LogOutput, BollardError>> + Send + 'static,
) -> ByteStream {
    output
        .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(anyhow::Error::from))
        .boxed()
}

/// Container directory to request for a `docker cp`-style source, where a
/// trailing `/.` means "the contents of".
fn archive_source(src: &str) -> &str {
    let trimmed = src.trim_end_matches("/.").trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

/// Path of an archive entry below its top-level directory, or `None` for the
/// top-level entry itself and for anything that would escape `dest`.
fn entry_target(entry_path: &Path) -> Option<PathBuf> {
    let mut components = entry_path.components();
    components.next()?;
    let rel: PathBuf = components
        .map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect::<Option<PathBuf>>()?;
    if rel.as_os_str().is_empty() { None } else { Some(rel) }
}

/// Unpack the entries under the archive's top-level directory into `dest`.
fn unpack_contents(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    std::fs::create_dir_all(dest)?;
    for entry in archive.entries().context("Failed to read container archive")? {
        let mut entry = entry?;
        let Some(rel) = entry_target(&entry.path()?) else {
            continue;
        };
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("Failed to unpack {}", target.display()))?;
    }
    Ok(())
}

/// Single-file tar archive holding `src` under `name`.
fn pack_file(src: &Path, name: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_path_with_name(src, name)
        .with_context(|| format!("Failed to archive {}", src.display()))?;
    builder.into_inner().context("Failed to finish archive")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        debug!(container_id, cmd = ?spec.cmd, user = ?spec.user, "exec");
        let (exec_id, started) = self
            .start_attached(container_id, exec_options(&spec), false)
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    other => stdout.extend_from_slice(&other.into_bytes()),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec_id)
            .await
            .context("Failed to inspect exec")?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn exec_stream(&self, container_id: &str, spec: ExecSpec) -> Result<ByteStream> {
        match self
            .start_attached(container_id, exec_options(&spec), false)
            .await?
        {
            (_, StartExecResults::Attached { output, .. }) => Ok(into_byte_stream(output)),
            (_, StartExecResults::Detached) => anyhow::bail!("exec unexpectedly detached"),
        }
    }

    async fn open_pty(
        &self,
        container_id: &str,
        shell: &str,
        working_dir: &str,
        size: PtySize,
    ) -> Result<PtyHandle> {
        let options = CreateExecOptions {
            cmd: Some(vec![shell.to_string()]),
            env: Some(vec!["TERM=xterm-256color".to_string()]),
            working_dir: Some(working_dir.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        match self.start_attached(container_id, options, true).await? {
            (exec_id, StartExecResults::Attached { output, input }) => {
                self.resize_pty(&exec_id, size).await?;
                Ok(PtyHandle {
                    exec_id,
                    output: into_byte_stream(output),
                    input,
                })
            }
            (_, StartExecResults::Detached) => anyhow::bail!("PTY exec unexpectedly detached"),
        }
    }

    async fn resize_pty(&self, exec_id: &str, size: PtySize) -> Result<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .context("Failed to resize PTY")
    }

    async fn copy_from_container(&self, container_id: &str, src: &str, dest: &Path) -> Result<()> {
        let options = DownloadFromContainerOptionsBuilder::default()
            .path(archive_source(src))
            .build();
        let mut stream = self.docker.download_from_container(container_id, Some(options));

        let archive = tempfile::NamedTempFile::new().context("Failed to create archive file")?;
        let mut file = tokio::fs::File::create(archive.path()).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to download {src} from {container_id}"))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_contents(archive.path(), &dest))
            .await
            .context("Archive unpack task failed")?
    }

    async fn copy_to_container(&self, container_id: &str, src: &Path, dest: &str) -> Result<()> {
        let (dir, name) = match dest.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => ("/", dest),
        };
        let src = src.to_path_buf();
        let name_owned = name.to_string();
        let archive = tokio::task::spawn_blocking(move || pack_file(&src, &name_owned))
            .await
            .context("Archive pack task failed")??;

        let options = UploadToContainerOptionsBuilder::default().path(dir).build();
        self.docker
            .upload_to_container(container_id, Some(options), bollard::body_full(archive.into()))
            .await
            .with_context(|| format!("Failed to upload {dest} to {container_id}"))
    }

    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).context("Failed to inspect container"),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptionsBuilder::default().all(false).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                if let Some(prefix) = &self.prefix
                    && !name.starts_with(prefix.as_str())
                {
                    return None;
                }
                Some(ContainerSummary {
                    id: c.id?,
                    name,
                    image: c.image.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                })
            })
            .collect())
    }
}
