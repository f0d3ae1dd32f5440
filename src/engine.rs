//! Ties terminal sessions to change monitoring and shadow syncing.
//!
//! A session starting triggers one baseline sync followed by a Change Monitor.
//! Every coalesced change runs a sync whose result goes to the container's
//! attached clients. A session ending stops its monitor and releases the
//! shadow repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::container::{ContainerRuntime, TimeoutRuntime};
use crate::errors::GitWorkflowError;
use crate::protocol::ServerMessage;
use crate::sync::{MonitorHandle, SyncOrchestrator, SyncOutcome, monitor};
use crate::terminal::{SessionEvent, SessionRegistry};

pub struct Engine {
    settings: Settings,
    runtime: Arc<dyn ContainerRuntime>,
    registry: SessionRegistry,
    orchestrator: SyncOrchestrator,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    changes: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Engine {
    /// Build the engine and spawn its event loop.
    pub fn start(settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> (Arc<Self>, JoinHandle<()>) {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(TimeoutRuntime::new(runtime, settings.sync.command_timeout));
        let (registry, session_events) = SessionRegistry::new(
            runtime.clone(),
            settings.terminal.clone(),
            settings.sync.container_path.clone(),
        );
        let orchestrator = SyncOrchestrator::new(settings.clone(), runtime.clone());
        let (changes, change_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            settings,
            runtime,
            registry,
            orchestrator,
            monitors: Mutex::new(HashMap::new()),
            changes,
            cancel: CancellationToken::new(),
        });
        let task = tokio::spawn(engine.clone().run(session_events, change_rx));
        (engine, task)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    async fn run(
        self: Arc<Self>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut change_rx: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = session_events.recv() => self.clone().on_session_event(event),
                Some(container_id) = change_rx.recv() => {
                    let engine = self.clone();
                    tokio::spawn(async move { engine.sync_and_broadcast(&container_id).await });
                }
                else => break,
            }
        }
        debug!("engine event loop stopped");
    }

    fn on_session_event(self: Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Started { container_id } => {
                tokio::spawn(async move { self.begin_tracking(&container_id).await });
            }
            SessionEvent::Ended { container_id } => {
                tokio::spawn(async move { self.end_tracking(&container_id).await });
            }
        }
    }

    async fn begin_tracking(&self, container_id: &str) {
        // Baseline first so the first reported diff only holds agent edits.
        self.sync_and_broadcast(container_id).await;

        if self.registry.info(container_id).await.is_none() {
            return;
        }
        let handle = monitor::start(
            self.runtime.clone(),
            container_id,
            &self.settings.sync,
            self.changes.clone(),
        );
        if let Ok(mut monitors) = self.monitors.lock() {
            monitors.insert(container_id.to_string(), handle);
        }
        // The session may have ended while the monitor was starting.
        if self.cancel.is_cancelled() || self.registry.info(container_id).await.is_none() {
            self.stop_monitor(container_id);
        }
    }

    async fn end_tracking(&self, container_id: &str) {
        self.stop_monitor(container_id);
        self.orchestrator.release(container_id).await;
        info!(container_id, "stopped tracking container");
    }

    fn stop_monitor(&self, container_id: &str) {
        let handle = self
            .monitors
            .lock()
            .ok()
            .and_then(|mut monitors| monitors.remove(container_id));
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    /// Run one sync and report its result to the container's clients.
    pub async fn sync_and_broadcast(&self, container_id: &str) {
        if self.registry.info(container_id).await.is_none() {
            debug!(container_id, "no session, skipping sync");
            return;
        }
        let msg = match self.orchestrator.sync(container_id).await {
            Ok(SyncOutcome::Completed(report)) => {
                if let Some(branch) = &report.switched_branch {
                    info!(container_id, branch = %branch, "shadow repository followed container branch");
                }
                ServerMessage::SyncComplete {
                    container_id: report.container_id,
                    has_changes: report.has_changes,
                    summary: report.summary,
                    diff_data: report.diff,
                }
            }
            Ok(SyncOutcome::Skipped(reason)) => {
                debug!(container_id, ?reason, "sync skipped");
                return;
            }
            Err(e) => {
                warn!(container_id, error = %e, "sync failed");
                ServerMessage::SyncError {
                    container_id: container_id.to_string(),
                    message: format!("{e:#}"),
                }
            }
        };
        if self.registry.broadcast(container_id, &msg).await == 0
            && self.registry.info(container_id).await.is_none()
        {
            // Ended mid-sync, after the release ran; drop what the sync recreated.
            self.orchestrator.release(container_id).await;
        }
    }

    /// Commit the shadow repository. The reply goes to the requester only;
    /// attached clients get a fresh sync result on success.
    pub async fn commit(&self, container_id: &str, message: &str) -> ServerMessage {
        let result = match self.require_session(container_id).await {
            Ok(()) => self.orchestrator.commit(container_id, message).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(commit) => {
                self.sync_and_broadcast(container_id).await;
                ServerMessage::CommitSuccess {
                    container_id: container_id.to_string(),
                    commit,
                }
            }
            Err(e) => {
                warn!(container_id, error = %e, "commit failed");
                self.release_if_orphaned(container_id).await;
                ServerMessage::CommitError {
                    message: format!("{e:#}"),
                }
            }
        }
    }

    pub async fn push(&self, container_id: &str, branch: Option<&str>) -> ServerMessage {
        let result = match self.require_session(container_id).await {
            Ok(()) => self.orchestrator.push(container_id, branch).await,
            Err(e) => Err(e),
        };
        self.release_if_orphaned(container_id).await;
        match result {
            Ok(branch) => {
                info!(container_id, branch = %branch, "pushed shadow repository");
                ServerMessage::PushSuccess {
                    container_id: container_id.to_string(),
                    branch,
                }
            }
            Err(e) => {
                warn!(container_id, error = %e, "push failed");
                ServerMessage::PushError {
                    message: format!("{e:#}"),
                }
            }
        }
    }

    /// Shadow repositories only exist for containers with a live session.
    async fn require_session(&self, container_id: &str) -> Result<(), GitWorkflowError> {
        match self.registry.info(container_id).await {
            Some(_) => Ok(()),
            None => Err(GitWorkflowError::NoSession {
                container_id: container_id.to_string(),
            }),
        }
    }

    /// Drop a shadow repository whose session ended while a request used it.
    async fn release_if_orphaned(&self, container_id: &str) {
        if self.registry.info(container_id).await.is_none() {
            self.orchestrator.release(container_id).await;
        }
    }

    pub fn monitored(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .monitors
            .lock()
            .map(|monitors| monitors.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Stop monitors, end sessions and delete every shadow repository.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let monitors: Vec<MonitorHandle> = self
            .monitors
            .lock()
            .map(|mut monitors| monitors.drain().map(|(_, handle)| handle).collect())
            .unwrap_or_default();
        for handle in &monitors {
            handle.stop();
        }
        self.registry.shutdown().await;
        self.orchestrator.shutdown().await;
        info!("engine shut down");
    }
}
