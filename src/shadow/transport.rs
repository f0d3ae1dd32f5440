//! Container-side helpers for a sync: ownership repair, tool installation and
//! transport selection. Nothing here fails a sync; every chain degrades to a
//! logged warning.

use std::fmt;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::container::{ContainerRuntime, ExecSpec, has_command};
use crate::fallback::first_success;

/// How container files reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `rsync` inside the container into a filtered staging dir, then one copy out.
    Rsync,
    /// Copy the whole workspace out and filter on the host.
    DockerCp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Rsync => write!(f, "rsync"),
            Transport::DockerCp => write!(f, "docker-cp"),
        }
    }
}

/// Escalating attempts at `chown -R` on the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipFix {
    Root,
    Default,
    Sudo,
}

impl OwnershipFix {
    pub const ALL: [OwnershipFix; 3] = [OwnershipFix::Root, OwnershipFix::Default, OwnershipFix::Sudo];

    fn spec(self, path: &str, user: &str) -> ExecSpec {
        let chown = format!("chown -R {user}:{user} {}", sh_quote(path));
        match self {
            OwnershipFix::Root => ExecSpec::shell(chown).user("root"),
            OwnershipFix::Default => ExecSpec::shell(chown),
            OwnershipFix::Sudo => ExecSpec::shell(format!("sudo -n {chown}")),
        }
    }
}

impl fmt::Display for OwnershipFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipFix::Root => write!(f, "root"),
            OwnershipFix::Default => write!(f, "default-user"),
            OwnershipFix::Sudo => write!(f, "sudo"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    AptGet,
    Apk,
    Dnf,
    Yum,
}

impl PackageManager {
    pub const ALL: [PackageManager; 4] = [
        PackageManager::AptGet,
        PackageManager::Apk,
        PackageManager::Dnf,
        PackageManager::Yum,
    ];

    pub fn install_script(self, package: &str) -> String {
        match self {
            PackageManager::AptGet => {
                format!("apt-get update -qq && apt-get install -y -qq {package}")
            }
            PackageManager::Apk => format!("apk add --no-cache {package}"),
            PackageManager::Dnf => format!("dnf install -y -q {package}"),
            PackageManager::Yum => format!("yum install -y -q {package}"),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::AptGet => write!(f, "apt-get"),
            PackageManager::Apk => write!(f, "apk"),
            PackageManager::Dnf => write!(f, "dnf"),
            PackageManager::Yum => write!(f, "yum"),
        }
    }
}

/// Single-quote `s` for `sh -c`.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Best-effort `chown` of `path` to `user`. Returns the attempt that worked.
pub async fn fix_ownership(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    path: &str,
    user: &str,
) -> Option<OwnershipFix> {
    let result = first_success(&OwnershipFix::ALL, |fix| async move {
        runtime
            .exec(container_id, fix.spec(path, user))
            .await?
            .into_stdout()
            .map(|_| ())
    })
    .await;

    match result {
        Ok((fix, ())) => {
            debug!(container_id, strategy = %fix, "fixed workspace ownership");
            Some(fix)
        }
        Err(e) => {
            warn!(container_id, error = %e, "could not fix workspace ownership");
            None
        }
    }
}

/// Make sure `tool` is on the container's PATH, installing `package` with the
/// first package manager that works.
pub async fn ensure_tool(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    tool: &str,
    package: &str,
) -> bool {
    if has_command(runtime, container_id, tool).await {
        return true;
    }

    let result = first_success(&PackageManager::ALL, |manager| async move {
        install(runtime, container_id, manager, package).await?;
        if !has_command(runtime, container_id, tool).await {
            anyhow::bail!("{tool} still missing after install");
        }
        anyhow::Ok(())
    })
    .await;

    match result {
        Ok((manager, ())) => {
            info!(container_id, tool, manager = %manager, "installed tool in container");
            true
        }
        Err(e) => {
            warn!(container_id, tool, error = %e, "could not install tool in container");
            false
        }
    }
}

async fn install(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    manager: PackageManager,
    package: &str,
) -> Result<()> {
    runtime
        .exec(
            container_id,
            ExecSpec::shell(manager.install_script(package)).user("root"),
        )
        .await?
        .into_stdout()?;
    Ok(())
}

/// Prefer rsync inside the container; fall back to `docker cp`.
pub async fn select_transport(runtime: &dyn ContainerRuntime, container_id: &str) -> Transport {
    if ensure_tool(runtime, container_id, "rsync", "rsync").await {
        Transport::Rsync
    } else {
        warn!(container_id, "rsync unavailable, falling back to docker cp");
        Transport::DockerCp
    }
}

/// Whether `rsync` is installed on the host.
pub async fn host_has_rsync() -> bool {
    tokio::process::Command::new("rsync")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
