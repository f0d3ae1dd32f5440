use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::info;

use super::api::{self, AppState};
use super::github::GitHubClient;
use super::ws;
use crate::config::Settings;
use crate::container::ContainerRuntime;
use crate::engine::Engine;

/// Configuration for the session server.
pub struct ServerConfig {
    pub settings: Settings,
    /// Allow cross-origin requests, for a UI served from elsewhere.
    pub dev_mode: bool,
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the session server and run until Ctrl-C.
pub async fn start_server(config: ServerConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<()> {
    let ServerConfig { settings, dev_mode } = config;
    std::fs::create_dir_all(&settings.sync.temp_root).with_context(|| {
        format!(
            "Failed to create shadow repository root {}",
            settings.sync.temp_root.display()
        )
    })?;

    let addr = settings.bind_address();
    let github = GitHubClient::new(&settings.github);
    let (engine, engine_task) = Engine::start(settings, runtime);
    let state = Arc::new(AppState {
        engine: engine.clone(),
        github,
    });

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "shadowbox listening");
    println!("shadowbox running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    engine.shutdown().await;
    let _ = engine_task.await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down");
}
