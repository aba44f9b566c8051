//! ---
//! mtr_section: "05-networking-external-interfaces"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Client WebSocket surface and session fan-out."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::{SessionId, SessionRegistry};

/// Turns one inbound text message into exactly one reply.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle `text` received from `session` and return the reply text.
    async fn handle(&self, session: SessionId, text: &str) -> String;

    /// Reply sent when a client sends a binary frame.
    fn binary_unsupported(&self, _session: SessionId) -> String {
        r#"{"type":"error","result":"binary frames are not supported","kind":"protocol_error"}"#
            .to_owned()
    }
}

struct WebSocketState {
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn CommandHandler>,
}

/// Builder for the client-facing WebSocket server.
#[derive(Clone)]
pub struct WebSocketServerBuilder {
    listen: SocketAddr,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn CommandHandler>,
}

impl WebSocketServerBuilder {
    /// Serve on `listen`, registering sessions in `registry` and routing
    /// commands to `handler`.
    pub fn new(
        listen: SocketAddr,
        registry: Arc<SessionRegistry>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            listen,
            registry,
            handler,
        }
    }

    /// Bind, spawn the server and return a shutdown handle.
    pub async fn spawn(self) -> anyhow::Result<WebSocketServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "websocket server listening");

        let state = Arc::new(WebSocketState {
            registry: self.registry,
            handler: self.handler,
        });

        let app = Router::new()
            .route("/", get(upgrade_handler))
            .route("/ws", get(upgrade_handler))
            .with_state(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "websocket server exited with error");
            }
        });

        Ok(WebSocketServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle for the running WebSocket server.
pub struct WebSocketServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WebSocketServerHandle {
    /// Return the bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting connections and wait for the listener task.
    ///
    /// Upgraded sessions are not tracked by the listener; callers close them
    /// by dropping the registry entries.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebSocketState>>,
) -> axum::response::Response {
    ws.on_upgrade(|socket| client_loop(socket, state))
}

async fn client_loop(socket: WebSocket, state: Arc<WebSocketState>) {
    let (session, broadcasts) = state.registry.add();
    let (sink, mut stream) = socket.split();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel::<Message>();
    let mut writer = tokio::spawn(write_loop(session, sink, replies_rx, broadcasts));

    let writer_finished = loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(session = %session, "writer finished; closing reader");
                break true;
            }
            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else {
                    break false;
                };
                let reply = match message {
                    Message::Text(text) => {
                        Message::Text(state.handler.handle(session, &text).await)
                    }
                    Message::Binary(_) => Message::Text(state.handler.binary_unsupported(session)),
                    Message::Ping(payload) => Message::Pong(payload),
                    Message::Pong(_) => continue,
                    Message::Close(_) => break false,
                };
                if replies_tx.send(reply).is_err() {
                    break false;
                }
            }
        }
    };

    state.registry.remove(session);
    drop(replies_tx);
    if !writer_finished {
        let _ = writer.await;
    }
}

async fn write_loop(
    session: SessionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut replies: mpsc::UnboundedReceiver<Message>,
    mut broadcasts: mpsc::Receiver<Arc<str>>,
) {
    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(message) => message,
                None => break,
            },
            broadcast = broadcasts.recv() => match broadcast {
                Some(text) => Message::Text(text.to_string()),
                None => {
                    debug!(session = %session, "session removed from registry");
                    break;
                }
            },
        };
        if let Err(err) = sink.send(message).await {
            debug!(session = %session, error = %err, "client send failed");
            break;
        }
    }
    let _ = sink.close().await;
}
