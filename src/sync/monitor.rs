//! Container filesystem change detection.
//!
//! Each monitored container gets one task. It first tries an `inotifywait`
//! stream inside the container; every event pushes a debounce deadline back
//! and only the deadline firing emits a "changed" signal. If the watcher can't
//! be installed, fails, or its stream ends, the task switches to a fixed
//! interval poller for the rest of the session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::container::{ByteStream, ContainerRuntime, ExecSpec};
use crate::shadow::transport::ensure_tool;

const WATCH_EVENTS: &str = "modify,create,delete,move";

/// Explicit debounce timer: `Idle` or `Pending(deadline)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending(Instant),
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: DebounceState::Idle,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// An event arrived: (re)start the window.
    pub fn record(&mut self, now: Instant) {
        self.state = DebounceState::Pending(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Idle => None,
            DebounceState::Pending(deadline) => Some(deadline),
        }
    }

    /// Returns true exactly once per window, when `now` has reached the deadline.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::Pending(deadline) if now >= deadline => {
                self.state = DebounceState::Idle;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Uninitialized,
    EventDriven,
    Polling,
    Stopped,
}

/// Running monitor. Dropping the handle stops the task.
pub struct MonitorHandle {
    container_id: String,
    cancel: CancellationToken,
    mode: Arc<Mutex<MonitorMode>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
            .lock()
            .map(|m| *m)
            .unwrap_or(MonitorMode::Stopped)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        set_mode(&self.mode, MonitorMode::Stopped);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn set_mode(mode: &Mutex<MonitorMode>, next: MonitorMode) {
    if let Ok(mut current) = mode.lock() {
        // Stopped is terminal.
        if *current != MonitorMode::Stopped {
            *current = next;
        }
    }
}

/// `--exclude` regex for inotifywait from directory names.
pub fn watch_exclude_regex(names: &[String]) -> String {
    let alternatives: Vec<String> = names.iter().map(|n| n.replace('.', r"\.")).collect();
    format!("(^|/)({})(/|$)", alternatives.join("|"))
}

enum WatchOutcome {
    Cancelled,
    Failed(String),
}

struct Monitor {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    settings: SyncSettings,
    changes: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    mode: Arc<Mutex<MonitorMode>>,
}

/// Start watching `container_id`. Each coalesced change sends the container id
/// on `changes`.
pub fn start(
    runtime: Arc<dyn ContainerRuntime>,
    container_id: &str,
    settings: &SyncSettings,
    changes: mpsc::UnboundedSender<String>,
) -> MonitorHandle {
    let cancel = CancellationToken::new();
    let mode = Arc::new(Mutex::new(MonitorMode::Uninitialized));
    let monitor = Monitor {
        runtime,
        container_id: container_id.to_string(),
        settings: settings.clone(),
        changes,
        cancel: cancel.clone(),
        mode: mode.clone(),
    };
    let task = tokio::spawn(monitor.run());
    MonitorHandle {
        container_id: container_id.to_string(),
        cancel,
        mode,
        task,
    }
}

impl Monitor {
    async fn run(self) {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return,
            opened = self.open_watch() => opened,
        };

        match opened {
            Ok(stream) => {
                set_mode(&self.mode, MonitorMode::EventDriven);
                info!(container_id = %self.container_id, "watching container for changes");
                match self.watch(stream).await {
                    WatchOutcome::Cancelled => return,
                    WatchOutcome::Failed(reason) => {
                        warn!(container_id = %self.container_id, reason = %reason, "watcher stopped, falling back to polling");
                    }
                }
            }
            Err(e) => {
                warn!(container_id = %self.container_id, error = %format!("{e:#}"), "watcher unavailable, falling back to polling");
            }
        }

        set_mode(&self.mode, MonitorMode::Polling);
        self.poll().await;
    }

    async fn open_watch(&self) -> Result<ByteStream> {
        let runtime = self.runtime.as_ref();
        if !ensure_tool(runtime, &self.container_id, "inotifywait", "inotify-tools").await {
            anyhow::bail!("inotifywait is not installed and could not be installed");
        }
        let exclude = watch_exclude_regex(&self.settings.watch_excludes);
        let spec = ExecSpec::new([
            "inotifywait",
            "-m",
            "-r",
            "-q",
            "-e",
            WATCH_EVENTS,
            "--exclude",
            exclude.as_str(),
            self.settings.container_path.as_str(),
        ]);
        runtime.exec_stream(&self.container_id, spec).await
    }

    async fn watch(&self, mut stream: ByteStream) -> WatchOutcome {
        let mut debouncer = Debouncer::new(self.settings.debounce);
        loop {
            let deadline = debouncer.deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = self.cancel.cancelled() => return WatchOutcome::Cancelled,
                event = stream.next() => match event {
                    Some(Ok(_)) => debouncer.record(Instant::now()),
                    Some(Err(e)) => return WatchOutcome::Failed(format!("{e:#}")),
                    None => return WatchOutcome::Failed("watch stream ended".to_string()),
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    if debouncer.poll(Instant::now()) && !self.signal() {
                        return WatchOutcome::Cancelled;
                    }
                }
            }
        }
    }

    async fn poll(&self) {
        let interval = self.settings.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.signal() {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false once nobody is listening.
    fn signal(&self) -> bool {
        debug!(container_id = %self.container_id, "change detected");
        self.changes.send(self.container_id.clone()).is_ok()
    }
}
