use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::github::{self, GitHubClient, PullRequest};
use crate::container::container_branch;
use crate::engine::Engine;
use crate::shadow::{ChangeSummary, git};
use crate::terminal::SessionInfo;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Arc<Engine>,
    pub github: GitHubClient,
}

pub type SharedState = Arc<AppState>;

// ── Response types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    /// Present while a terminal session is open.
    pub session: Option<SessionInfo>,
    pub syncing: bool,
    pub last_sync: Option<LastSync>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSync {
    pub has_changes: bool,
    pub summary: ChangeSummary,
    pub files: usize,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    pub branch: Option<String>,
    /// Where the branch was read from: `container`, `shadow` or `repository`.
    pub branch_source: Option<&'static str>,
    pub remote_url: Option<String>,
    pub branch_url: Option<String>,
    pub pull_request: Option<PullRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfoQuery {
    pub container_id: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/containers", get(list_containers))
        .route("/api/git-info", get(git_info))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_containers(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let engine = &state.engine;
    let containers = engine
        .runtime()
        .list_containers()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to list containers: {:#}", e)))?;
    let mut sessions = engine.registry().list().await;

    let views: Vec<ContainerView> = containers
        .into_iter()
        .map(|c| {
            let session = sessions
                .iter()
                .position(|s| s.container_id == c.id)
                .map(|i| sessions.swap_remove(i));
            let last_sync = engine.orchestrator().last_report(&c.id).map(|r| LastSync {
                has_changes: r.has_changes,
                summary: r.summary,
                files: r.diff.stats.files,
                completed_at: r.completed_at,
            });
            ContainerView {
                syncing: engine.orchestrator().is_syncing(&c.id),
                id: c.id,
                name: c.name,
                image: c.image,
                status: c.status,
                session,
                last_sync,
            }
        })
        .collect();
    Ok(Json(views))
}

async fn git_info(
    State(state): State<SharedState>,
    Query(query): Query<GitInfoQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let container_id = query.container_id.trim();
    if container_id.is_empty() {
        return Err(ApiError::BadRequest("containerId is required".into()));
    }
    Ok(Json(resolve_git_info(&state, container_id).await))
}

/// Branch from the container, else the shadow repository, else the user's
/// repository; remote and pull request from the user's repository.
async fn resolve_git_info(state: &AppState, container_id: &str) -> GitInfo {
    let engine = &state.engine;
    let settings = engine.settings();

    let (branch, branch_source) = match container_branch(
        engine.runtime().as_ref(),
        container_id,
        &settings.sync.container_path,
    )
    .await
    {
        Ok(branch) => (Some(branch), Some("container")),
        Err(e) => {
            debug!(container_id, error = %format!("{e:#}"), "container branch unavailable");
            match engine.orchestrator().current_branch(container_id) {
                Some(branch) => (Some(branch), Some("shadow")),
                None => match git::current_branch(&settings.repo_path) {
                    Some(branch) => (Some(branch), Some("repository")),
                    None => (None, None),
                },
            }
        }
    };

    let remote_url = git::remote_url(&settings.repo_path, "origin");
    let mut info = GitInfo {
        branch,
        branch_source,
        remote_url,
        ..Default::default()
    };

    let slug = info.remote_url.as_deref().and_then(github::parse_repo_slug);
    if let (Some(slug), Some(branch)) = (slug, info.branch.clone()) {
        info.branch_url = Some(github::branch_url(&slug, &branch));
        match state.github.find_pull_request(&slug, &branch).await {
            Ok(pr) => info.pull_request = pr,
            Err(e) => debug!(repo = %slug, error = %format!("{e:#}"), "pull request lookup failed"),
        }
    }
    info
}
