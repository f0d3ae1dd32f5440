use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::api::SharedState;
use crate::engine::Engine;
use crate::errors::SessionError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::terminal::{ClientId, ClientSender};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

async fn handle_socket(socket: WebSocket, engine: Arc<Engine>) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut conn = Connection {
        id: Uuid::new_v4(),
        engine,
        tx,
        container_id: None,
    };
    debug!(client = %conn.id, "client connected");
    run_socket_loop(&mut conn, sender, receiver, rx).await;
    conn.detach().await;
    debug!(client = %conn.id, "client disconnected");
}

/// One browser connection. Attached to at most one container at a time.
struct Connection {
    id: ClientId,
    engine: Arc<Engine>,
    tx: ClientSender,
    container_id: Option<String>,
}

impl Connection {
    fn reply(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg);
    }

    fn error(&self, message: impl Into<String>, code: Option<&str>) {
        self.reply(ServerMessage::Error {
            message: message.into(),
            code: code.map(String::from),
        });
    }

    fn session_error(&self, err: &SessionError) {
        self.error(err.to_string(), err.code());
    }

    async fn detach(&mut self) {
        if let Some(container_id) = self.container_id.take() {
            self.engine.registry().detach(&container_id, self.id).await;
        }
    }

    fn attached(&self) -> Option<&str> {
        let container_id = self.container_id.as_deref();
        if container_id.is_none() {
            self.session_error(&SessionError::NotAttached);
        }
        container_id
    }

    async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => self.error(format!("Invalid message: {}", e), None),
        }
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Attach {
                container_id,
                cols,
                rows,
            } => {
                if self.container_id.as_deref() != Some(container_id.as_str()) {
                    self.detach().await;
                }
                let size = ClientMessage::attach_size(cols, rows);
                match self
                    .engine
                    .registry()
                    .attach(&container_id, self.id, self.tx.clone(), size)
                    .await
                {
                    Ok(()) => self.container_id = Some(container_id),
                    Err(e) => {
                        warn!(client = %self.id, container_id = %container_id, error = %e, "attach failed");
                        self.session_error(&e);
                    }
                }
            }
            ClientMessage::Input { data } => self.input(data.as_bytes()).await,
            ClientMessage::Resize { cols, rows } => {
                let Some(container_id) = self.attached() else {
                    return;
                };
                let size = crate::container::PtySize { cols, rows };
                if let Err(e) = self.engine.registry().resize(container_id, size).await {
                    self.session_error(&e);
                }
            }
            ClientMessage::CommitChanges {
                container_id,
                commit_message,
            } => {
                let engine = self.engine.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let reply = engine.commit(&container_id, &commit_message).await;
                    let _ = tx.send(reply);
                });
            }
            ClientMessage::PushChanges {
                container_id,
                branch_name,
            } => {
                let engine = self.engine.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let branch = branch_name.as_deref().filter(|b| !b.trim().is_empty());
                    let reply = engine.push(&container_id, branch).await;
                    let _ = tx.send(reply);
                });
            }
        }
    }

    async fn input(&self, data: &[u8]) {
        let Some(container_id) = self.attached() else {
            return;
        };
        if let Err(e) = self.engine.registry().write_input(container_id, data).await {
            self.session_error(&e);
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards queued server messages, dispatches client messages, and sends a
/// Ping every [`PING_INTERVAL`]. If no Pong arrives within [`PONG_TIMEOUT`]
/// the connection is considered dead and the loop exits.
async fn run_socket_loop(
    conn: &mut Connection,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(client = %conn.id, "pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Outgoing messages ───────────────────────────────────
            Some(msg) = rx.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize server message");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => conn.handle_text(text.as_str()).await,
                    Some(Ok(Message::Binary(data))) => conn.input(&data).await,
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
