use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default location of the per-repository config file, relative to the repo root.
pub const CONFIG_RELATIVE_PATH: &str = ".shadowbox/config.toml";

/// Runtime settings for the session server and the sync pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    /// The user's working repository. Never written to.
    pub repo_path: PathBuf,
    /// Branch the shadow repository should work on. `None` means "same as the source".
    pub target_branch: Option<String>,
    pub server: ServerSettings,
    pub sync: SyncSettings,
    pub terminal: TerminalSettings,
    pub git: GitSettings,
    pub github: GitHubSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Only containers whose name starts with this prefix are listed.
    pub container_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub container_path: String,
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub temp_root: PathBuf,
    pub container_user: String,
    /// Promote docker-cp staging trees with the host's rsync when available.
    pub host_rsync: bool,
    pub watch_excludes: Vec<String>,
    /// Upper bound on any one git, rsync or container call.
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub history_limit: usize,
    pub shell: String,
}

#[derive(Debug, Clone)]
pub struct GitSettings {
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub api_url: String,
    pub token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
            container_prefix: None,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            container_path: "/workspace".to_string(),
            debounce: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(5000),
            temp_root: std::env::temp_dir().join("shadowbox-repos"),
            container_user: "node".to_string(),
            host_rsync: true,
            watch_excludes: vec![".git".to_string(), "node_modules".to_string()],
            command_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            history_limit: 100 * 1024,
            shell: "/bin/bash".to_string(),
        }
    }
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            author_name: "shadowbox".to_string(),
            author_email: "shadowbox@localhost".to_string(),
        }
    }
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

/// Raw TOML structure for `.shadowbox/config.toml`
#[derive(Debug, Deserialize)]
struct SettingsToml {
    branch: Option<String>,
    server: Option<ServerSection>,
    sync: Option<SyncSection>,
    terminal: Option<TerminalSection>,
    git: Option<GitSection>,
    github: Option<GitHubSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    container_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncSection {
    container_path: Option<String>,
    debounce_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    temp_root: Option<PathBuf>,
    container_user: Option<String>,
    host_rsync: Option<bool>,
    watch_excludes: Option<Vec<String>>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TerminalSection {
    history_limit: Option<usize>,
    shell: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitSection {
    author_name: Option<String>,
    author_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubSection {
    api_url: Option<String>,
    token: Option<String>,
}

impl Settings {
    /// Defaults for the given repository, without reading any file.
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            target_branch: None,
            server: ServerSettings::default(),
            sync: SyncSettings::default(),
            terminal: TerminalSettings::default(),
            git: GitSettings::default(),
            github: GitHubSettings::default(),
        }
    }

    /// Load settings from `.shadowbox/config.toml` in the repository.
    /// Returns defaults if the file doesn't exist.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_RELATIVE_PATH);
        let mut settings = Self::new(repo_path);
        if config_path.exists() {
            settings.merge_file(&config_path)?;
        }
        if settings.github.token.is_none() {
            settings.github.token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        }
        Ok(settings)
    }

    /// Overlay the values present in `path` onto these settings.
    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let toml: SettingsToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if let Some(branch) = toml.branch {
            self.target_branch = Some(branch);
        }
        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                self.server.host = host;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if server.container_prefix.is_some() {
                self.server.container_prefix = server.container_prefix;
            }
        }
        if let Some(sync) = toml.sync {
            if let Some(path) = sync.container_path {
                self.sync.container_path = path;
            }
            if let Some(ms) = sync.debounce_ms {
                self.sync.debounce = Duration::from_millis(ms);
            }
            if let Some(ms) = sync.poll_interval_ms {
                self.sync.poll_interval = Duration::from_millis(ms);
            }
            if let Some(root) = sync.temp_root {
                self.sync.temp_root = root;
            }
            if let Some(user) = sync.container_user {
                self.sync.container_user = user;
            }
            if let Some(host_rsync) = sync.host_rsync {
                self.sync.host_rsync = host_rsync;
            }
            if let Some(excludes) = sync.watch_excludes {
                self.sync.watch_excludes = excludes;
            }
            if let Some(secs) = sync.command_timeout_secs {
                self.sync.command_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(terminal) = toml.terminal {
            if let Some(limit) = terminal.history_limit {
                self.terminal.history_limit = limit;
            }
            if let Some(shell) = terminal.shell {
                self.terminal.shell = shell;
            }
        }
        if let Some(git) = toml.git {
            if let Some(name) = git.author_name {
                self.git.author_name = name;
            }
            if let Some(email) = git.author_email {
                self.git.author_email = email;
            }
        }
        if let Some(github) = toml.github {
            if let Some(url) = github.api_url {
                self.github.api_url = url;
            }
            if github.token.is_some() {
                self.github.token = github.token;
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
