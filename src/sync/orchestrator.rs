//! Drives shadow repository syncs, one at a time per container.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::container::ContainerRuntime;
use crate::errors::{GitWorkflowError, ShadowError};
use crate::shadow::{ChangeSummary, DiffData, RepoState, ShadowRepository, Transport};

type SharedRepo = Arc<tokio::sync::Mutex<ShadowRepository>>;

/// Result of one completed sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub container_id: String,
    pub has_changes: bool,
    pub summary: ChangeSummary,
    pub diff: DiffData,
    pub transport: Transport,
    /// Set when the shadow repository followed a branch change in the container.
    pub switched_branch: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another sync for the container is running.
    InFlight,
    /// The session ended while the sync ran; its result was discarded.
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

/// Removes the container from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    container_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.container_id);
        }
    }
}

pub struct SyncOrchestrator {
    settings: Settings,
    runtime: Arc<dyn ContainerRuntime>,
    repos: Mutex<HashMap<String, SharedRepo>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    baselined: Mutex<HashSet<String>>,
    last_reports: Mutex<HashMap<String, SyncReport>>,
}

impl SyncOrchestrator {
    pub fn new(settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            settings,
            runtime,
            repos: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            baselined: Mutex::new(HashSet::new()),
            last_reports: Mutex::new(HashMap::new()),
        }
    }

    fn try_begin(&self, container_id: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(container_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            container_id: container_id.to_string(),
        })
    }

    pub fn is_syncing(&self, container_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(container_id))
            .unwrap_or(false)
    }

    fn repo_for(&self, container_id: &str) -> Result<SharedRepo, ShadowError> {
        let mut repos = self
            .repos
            .lock()
            .map_err(|_| anyhow::anyhow!("shadow repository map poisoned"))?;
        let repo = repos.entry(container_id.to_string()).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(ShadowRepository::new(
                container_id,
                &self.settings,
                self.runtime.clone(),
            )))
        });
        Ok(repo.clone())
    }

    fn existing_repo(&self, container_id: &str) -> Option<SharedRepo> {
        self.repos.lock().ok()?.get(container_id).cloned()
    }

    fn is_current(&self, container_id: &str, repo: &SharedRepo) -> bool {
        self.existing_repo(container_id)
            .is_some_and(|current| Arc::ptr_eq(&current, repo))
    }

    /// Sync the container into its shadow repository, creating the repository
    /// on first use. Skips when a sync for the same container is running.
    pub async fn sync(&self, container_id: &str) -> Result<SyncOutcome, ShadowError> {
        let Some(_guard) = self.try_begin(container_id) else {
            debug!(container_id, "sync already in flight, skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::InFlight));
        };
        self.run_sync(container_id).await
    }

    async fn run_sync(&self, container_id: &str) -> Result<SyncOutcome, ShadowError> {
        let shared = self.repo_for(container_id)?;
        let mut repo = shared.lock().await;
        if !self.is_current(container_id, &shared) {
            return Ok(SyncOutcome::Skipped(SkipReason::Released));
        }

        if repo.state() != RepoState::Ready {
            repo.initialize().await?;
        }

        let switched_branch = match repo.reset_to_container_branch().await {
            Ok(branch) => branch,
            Err(e) => {
                warn!(container_id, error = %e, "could not follow container branch");
                None
            }
        };

        let transport = repo.sync_from_container().await?;

        let first = self
            .baselined
            .lock()
            .map(|mut set| set.insert(container_id.to_string()))
            .unwrap_or(false);
        if first {
            repo.baseline_commit().await?;
        }

        if !repo.is_present() || !self.is_current(container_id, &shared) {
            debug!(container_id, "session ended during sync, discarding result");
            return Ok(SyncOutcome::Skipped(SkipReason::Released));
        }

        let changes = repo.get_changes().await?;
        let diff = repo.diff().await?;
        let report = SyncReport {
            container_id: container_id.to_string(),
            has_changes: changes.has_changes,
            summary: changes.summary,
            diff,
            transport,
            switched_branch,
            completed_at: Utc::now(),
        };
        if let Ok(mut last) = self.last_reports.lock() {
            last.insert(container_id.to_string(), report.clone());
        }
        debug!(
            container_id,
            has_changes = report.has_changes,
            files = report.diff.stats.files,
            "sync complete"
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Most recent completed sync for the container.
    pub fn last_report(&self, container_id: &str) -> Option<SyncReport> {
        self.last_reports.lock().ok()?.get(container_id).cloned()
    }

    /// Branch of the container's shadow repository, if one exists and isn't busy.
    pub fn current_branch(&self, container_id: &str) -> Option<String> {
        let repo = self.existing_repo(container_id)?;
        let guard = repo.try_lock().ok()?;
        guard.current_branch()
    }

    /// Final sync, then commit everything in the shadow repository.
    pub async fn commit(&self, container_id: &str, message: &str) -> Result<String, GitWorkflowError> {
        self.final_sync(container_id).await?;
        let repo = self.existing_repo(container_id).ok_or(ShadowError::NotReady)?;
        let repo = repo.lock().await;
        let sha = repo.commit(message).await?;
        info!(container_id, commit = %sha, "committed shadow changes");
        Ok(sha)
    }

    /// Final sync, then push the shadow repository to `origin`.
    pub async fn push(&self, container_id: &str, branch: Option<&str>) -> Result<String, GitWorkflowError> {
        self.final_sync(container_id).await?;
        let repo = self.existing_repo(container_id).ok_or(ShadowError::NotReady)?;
        let repo = repo.lock().await;
        repo.push(branch).await
    }

    async fn final_sync(&self, container_id: &str) -> Result<(), ShadowError> {
        match self.sync(container_id).await? {
            SyncOutcome::Completed(_) => Ok(()),
            // The running sync holds the repository lock; callers queue behind it.
            SyncOutcome::Skipped(SkipReason::InFlight) => Ok(()),
            SyncOutcome::Skipped(SkipReason::Released) => Err(ShadowError::NotReady),
        }
    }

    /// Forget the container and delete its shadow repository. Waits for an
    /// in-flight sync to finish first.
    pub async fn release(&self, container_id: &str) -> bool {
        let repo = self
            .repos
            .lock()
            .ok()
            .and_then(|mut repos| repos.remove(container_id));
        if let Ok(mut set) = self.baselined.lock() {
            set.remove(container_id);
        }
        if let Ok(mut last) = self.last_reports.lock() {
            last.remove(container_id);
        }
        match repo {
            Some(repo) => {
                let mut repo = repo.lock().await;
                let removed = repo.cleanup().await;
                info!(container_id, removed, "released shadow repository");
                true
            }
            None => false,
        }
    }

    pub fn containers(&self) -> Vec<String> {
        self.repos
            .lock()
            .map(|repos| repos.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Release every shadow repository.
    pub async fn shutdown(&self) {
        for container_id in self.containers() {
            self.release(&container_id).await;
        }
    }
}
