use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shadowbox::logging::{self, LogFormat, LogOptions};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "shadowbox")]
#[command(version, about = "Shared container terminals with a shadow git repository of agent edits")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true, env = "SHADOWBOX_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the session server
    Serve {
        /// The user's repository (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Branch for shadow repositories to work on
        #[arg(long)]
        branch: Option<String>,

        /// Quiet period after the last file event before syncing
        #[arg(long)]
        debounce_ms: Option<u64>,

        /// Only list containers whose name starts with this prefix
        #[arg(long)]
        container_prefix: Option<String>,

        /// Allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Print the sync rules derived from a repository's index and .gitignore
    Rules {
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Report include/exclude for these relative paths instead
        #[arg(long)]
        check: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        format: cli.log_format,
        log_dir: cli.log_dir.clone(),
    })?;

    let current_dir = || std::env::current_dir().context("Failed to get current directory");

    match cli.command {
        Commands::Serve {
            repo,
            host,
            port,
            branch,
            debounce_ms,
            container_prefix,
            dev,
        } => {
            let repo = match repo {
                Some(repo) => repo,
                None => current_dir()?,
            };
            cmd::cmd_serve(
                &repo,
                cmd::ServeOverrides {
                    host,
                    port,
                    branch,
                    debounce_ms,
                    container_prefix,
                    dev,
                },
            )
            .await?;
        }
        Commands::Rules { repo, check } => {
            let repo = match repo {
                Some(repo) => repo,
                None => current_dir()?,
            };
            cmd::cmd_rules(&repo, &check)?;
        }
    }

    Ok(())
}
