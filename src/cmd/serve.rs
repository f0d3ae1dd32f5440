//! Session server command: `shadowbox serve`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shadowbox::config::Settings;
use shadowbox::container::docker::DockerRuntime;
use shadowbox::server::{ServerConfig, start_server};
use tracing::info;

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub branch: Option<String>,
    pub debounce_ms: Option<u64>,
    pub container_prefix: Option<String>,
    pub dev: bool,
}

impl ServeOverrides {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(branch) = &self.branch {
            settings.target_branch = Some(branch.clone());
        }
        if let Some(ms) = self.debounce_ms {
            settings.sync.debounce = Duration::from_millis(ms);
        }
        if let Some(prefix) = &self.container_prefix {
            settings.server.container_prefix = Some(prefix.clone());
        }
    }
}

pub async fn cmd_serve(repo: &Path, overrides: ServeOverrides) -> Result<()> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Repository path {} does not exist", repo.display()))?;
    let mut settings = Settings::load(&repo)?;
    overrides.apply(&mut settings);

    let runtime = DockerRuntime::connect(settings.server.container_prefix.clone())?;
    info!(
        repo = %repo.display(),
        address = %settings.bind_address(),
        debounce_ms = settings.sync.debounce.as_millis() as u64,
        "starting session server"
    );

    start_server(
        ServerConfig {
            settings,
            dev_mode: overrides.dev,
        },
        Arc::new(runtime),
    )
    .await
}
