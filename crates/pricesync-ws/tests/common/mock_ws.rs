//! Mock pricing stream server for integration tests.
//!
//! Provides a simple WebSocket server that can:
//! - Accept connections and count them
//! - Record received text frames
//! - Answer `ping` with a `heartbeat` frame (unless started silent)
//! - Push frames to, or close, every live connection

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum ServerCommand {
    Text(String),
    Close,
}

/// A mock pricing stream server.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    commands: broadcast::Sender<ServerCommand>,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockWsServer {
    /// Start a server that acknowledges pings.
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Start a server that never sends anything on its own.
    pub async fn start_silent() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(answer_pings: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (commands, _) = broadcast::channel(64);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let commands_clone = commands.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            messages_clone.clone(),
                            connections_clone.clone(),
                            commands_clone.subscribe(),
                            answer_pings,
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            commands,
            messages,
            connections,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Get the number of connections received.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Get all received text frames.
    pub async fn received_messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }

    /// Send a text frame to every live connection.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.commands.send(ServerCommand::Text(text.into()));
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<u32>>,
    mut commands: broadcast::Receiver<ServerCommand>,
    answer_pings: bool,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    *connections.lock().await += 1;

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    messages.lock().await.push(text.clone());

                    let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                        .map(|v| v.get("type") == Some(&serde_json::json!("ping")))
                        .unwrap_or(false);
                    if is_ping && answer_pings {
                        let ack = serde_json::json!({"type": "heartbeat"}).to_string();
                        let _ = write.send(Message::Text(ack)).await;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            cmd = commands.recv() => match cmd {
                Ok(ServerCommand::Text(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Ok(ServerCommand::Close) => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                Err(_) => {}
            },
        }
    }
}
