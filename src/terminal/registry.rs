//! One shared PTY per container, fanned out to every attached client.
//!
//! Sessions move through `attaching → active → ended`. Attaches to one
//! container are serialized by a per-container gate, so concurrent first
//! attaches still produce a single PTY, while the registry map itself is only
//! locked for lookups and inserts. A pump task per session
//! reads PTY output, appends it to the bounded history and forwards it to the
//! clients in order. When the PTY stream ends every client is told, the
//! session is dropped from the registry and a [`SessionEvent::Ended`] is
//! emitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::history::{OutputHistory, Utf8Carry};
use crate::config::TerminalSettings;
use crate::container::{ByteStream, ContainerRuntime, PtyInput, PtySize};
use crate::errors::SessionError;
use crate::protocol::ServerMessage;

pub type ClientId = Uuid;
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Session lifecycle notifications for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { container_id: String },
    Ended { container_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Attaching,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub container_id: String,
    pub clients: usize,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    pub history_bytes: usize,
}

struct Shared {
    clients: HashMap<ClientId, ClientSender>,
    history: OutputHistory,
    size: PtySize,
    state: SessionState,
}

impl Shared {
    /// Send to every client, dropping the ones that went away.
    fn broadcast(&mut self, msg: &ServerMessage) -> usize {
        self.clients.retain(|_, tx| tx.send(msg.clone()).is_ok());
        self.clients.len()
    }
}

struct Session {
    container_id: String,
    exec_id: String,
    input: tokio::sync::Mutex<PtyInput>,
    shared: Mutex<Shared>,
    cancel: CancellationToken,
}

impl Session {
    fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        self.shared.lock().ok().map(|mut shared| f(&mut shared))
    }

    fn info(&self) -> Option<SessionInfo> {
        self.with_shared(|s| SessionInfo {
            container_id: self.container_id.clone(),
            clients: s.clients.len(),
            cols: s.size.cols,
            rows: s.size.rows,
            state: s.state,
            history_bytes: s.history.len(),
        })
    }
}

type SessionMap = Arc<tokio::sync::Mutex<HashMap<String, Arc<Session>>>>;
type AttachGate = Arc<tokio::sync::Mutex<()>>;

pub struct SessionRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    settings: TerminalSettings,
    working_dir: String,
    sessions: SessionMap,
    attach_gates: Mutex<HashMap<String, AttachGate>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRegistry {
    /// Returns the registry and the receiving end of its lifecycle events.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: TerminalSettings,
        working_dir: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            runtime,
            settings,
            working_dir: working_dir.into(),
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            attach_gates: Mutex::new(HashMap::new()),
            events,
        };
        (registry, rx)
    }

    /// Join the container's session, opening the PTY on first attach. The
    /// client receives `attached`, a clear-screen frame, then the retained
    /// history.
    pub async fn attach(
        &self,
        container_id: &str,
        client_id: ClientId,
        client: ClientSender,
        size: Option<PtySize>,
    ) -> Result<(), SessionError> {
        let gate = self.attach_gate(container_id)?;
        let result = {
            let _serialized = gate.lock().await;
            self.join(container_id, client_id, client, size).await
        };
        self.release_gate(container_id, &gate);
        let (session, created, resize_to) = result?;

        if let Some(size) = resize_to
            && let Err(e) = self.runtime.resize_pty(&session.exec_id, size).await
        {
            debug!(container_id, error = %format!("{e:#}"), "resize on attach failed");
        }
        if created {
            let _ = self.events.send(SessionEvent::Started {
                container_id: container_id.to_string(),
            });
        }
        info!(container_id, client = %client_id, created, "client attached");
        Ok(())
    }

    fn attach_gate(&self, container_id: &str) -> Result<AttachGate, SessionError> {
        let mut gates = self
            .attach_gates
            .lock()
            .map_err(|_| anyhow::anyhow!("attach gates poisoned"))?;
        Ok(gates.entry(container_id.to_string()).or_default().clone())
    }

    fn release_gate(&self, container_id: &str, gate: &AttachGate) {
        if let Ok(mut gates) = self.attach_gates.lock()
            && Arc::strong_count(gate) <= 2
        {
            gates.remove(container_id);
        }
    }

    /// Add the client to the container's session, opening one if needed.
    /// Callers hold the container's attach gate.
    async fn join(
        &self,
        container_id: &str,
        client_id: ClientId,
        client: ClientSender,
        size: Option<PtySize>,
    ) -> Result<(Arc<Session>, bool, Option<PtySize>), SessionError> {
        let (session, created) = match self.session(container_id).await {
            Some(existing) => (existing, false),
            None => {
                let (session, output) = self.open_session(container_id, size).await?;
                self.sessions
                    .lock()
                    .await
                    .insert(container_id.to_string(), session.clone());
                tokio::spawn(pump(
                    self.sessions.clone(),
                    self.events.clone(),
                    session.clone(),
                    output,
                ));
                (session, true)
            }
        };

        let resize_to = session
            .with_shared(|shared| {
                let _ = client.send(ServerMessage::Attached {
                    container_id: container_id.to_string(),
                });
                let _ = client.send(ServerMessage::clear_screen());
                if !shared.history.is_empty() {
                    let _ = client.send(ServerMessage::output(shared.history.replay()));
                }
                shared.clients.insert(client_id, client);
                match size {
                    Some(size) if !created && size != shared.size => {
                        shared.size = size;
                        Some(size)
                    }
                    _ => None,
                }
            })
            .ok_or_else(|| anyhow::anyhow!("session state poisoned"))?;
        Ok((session, created, resize_to))
    }

    async fn open_session(
        &self,
        container_id: &str,
        size: Option<PtySize>,
    ) -> Result<(Arc<Session>, ByteStream), SessionError> {
        if !self.runtime.container_exists(container_id).await? {
            return Err(SessionError::ContainerNotFound {
                container_id: container_id.to_string(),
            });
        }
        let size = size.unwrap_or_default();
        let pty = self
            .runtime
            .open_pty(container_id, &self.settings.shell, &self.working_dir, size)
            .await?;

        let session = Arc::new(Session {
            container_id: container_id.to_string(),
            exec_id: pty.exec_id,
            input: tokio::sync::Mutex::new(pty.input),
            shared: Mutex::new(Shared {
                clients: HashMap::new(),
                history: OutputHistory::new(self.settings.history_limit),
                size,
                state: SessionState::Active,
            }),
            cancel: CancellationToken::new(),
        });
        info!(container_id, exec_id = %session.exec_id, cols = size.cols, rows = size.rows, "opened PTY session");
        Ok((session, pty.output))
    }

    async fn session(&self, container_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(container_id).cloned()
    }

    /// Remove a client. The session and its PTY stay up for reconnects.
    pub async fn detach(&self, container_id: &str, client_id: ClientId) -> bool {
        let Some(session) = self.session(container_id).await else {
            return false;
        };
        let removed = session
            .with_shared(|shared| shared.clients.remove(&client_id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(container_id, client = %client_id, "client detached");
        }
        removed
    }

    /// Forward raw input to the PTY.
    pub async fn write_input(&self, container_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let session = self
            .session(container_id)
            .await
            .ok_or(SessionError::NotAttached)?;
        let mut input = session.input.lock().await;
        input
            .write_all(data)
            .await
            .map_err(|e| SessionError::Other(anyhow::Error::new(e).context("Failed to write to PTY")))?;
        input
            .flush()
            .await
            .map_err(|e| SessionError::Other(anyhow::Error::new(e).context("Failed to flush PTY")))?;
        Ok(())
    }

    /// Resize the shared PTY. The most recent request wins.
    pub async fn resize(&self, container_id: &str, size: PtySize) -> Result<(), SessionError> {
        let session = self
            .session(container_id)
            .await
            .ok_or(SessionError::NotAttached)?;
        session.with_shared(|shared| shared.size = size);
        self.runtime.resize_pty(&session.exec_id, size).await?;
        Ok(())
    }

    /// Send `msg` to every client attached to the container. Returns how many
    /// clients received it.
    pub async fn broadcast(&self, container_id: &str, msg: &ServerMessage) -> usize {
        match self.session(container_id).await {
            Some(session) => session
                .with_shared(|shared| shared.broadcast(msg))
                .unwrap_or(0),
            None => 0,
        }
    }

    pub async fn info(&self, container_id: &str) -> Option<SessionInfo> {
        self.session(container_id).await?.info()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().filter_map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        infos
    }

    /// End every session. Clients get `container-disconnected`.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            session.cancel.cancel();
        }
    }
}

async fn pump(
    sessions: SessionMap,
    events: mpsc::UnboundedSender<SessionEvent>,
    session: Arc<Session>,
    mut output: ByteStream,
) {
    let container_id = session.container_id.clone();
    let mut carry = Utf8Carry::new();
    loop {
        let chunk = tokio::select! {
            _ = session.cancel.cancelled() => break,
            chunk = output.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let text = carry.push(&bytes);
                if !text.is_empty() {
                    forward_output(&session, text);
                }
            }
            Some(Err(e)) => {
                warn!(container_id = %container_id, error = %format!("{e:#}"), "PTY stream failed");
                break;
            }
            None => break,
        }
    }
    let rest = carry.flush();
    if !rest.is_empty() {
        forward_output(&session, rest);
    }

    session.with_shared(|shared| {
        shared.state = SessionState::Ended;
        shared.broadcast(&ServerMessage::ContainerDisconnected);
        shared.clients.clear();
    });

    {
        let mut map = sessions.lock().await;
        if map
            .get(&container_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            map.remove(&container_id);
        }
    }
    let _ = events.send(SessionEvent::Ended {
        container_id: container_id.clone(),
    });
    info!(container_id = %container_id, "PTY session ended");
}

fn forward_output(session: &Session, text: String) {
    session.with_shared(|shared| {
        shared.history.push(Bytes::from(text.clone()));
        shared.broadcast(&ServerMessage::Output { data: text });
    });
}
