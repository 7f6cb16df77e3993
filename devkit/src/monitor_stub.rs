/*!
Mock monitor service for testing without the real feed

Local WebSocket server that accepts any number of clients, pushes JSON
messages to all of them and can drop every open connection to exercise
client reconnects.
*/

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
enum ServerCommand {
    Push(String),
    DropAll,
}

pub struct MockMonitorServer {
    addr: SocketAddr,
    commands: broadcast::Sender<ServerCommand>,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl MockMonitorServer {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock monitor")?;
        let addr = listener.local_addr()?;
        let (commands, _) = broadcast::channel(256);
        let accepted = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let accept_task = {
            let commands = commands.clone();
            let accepted = Arc::clone(&accepted);
            let open = Arc::clone(&open);
            tokio::spawn(async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    let mut rx = commands.subscribe();
                    let accepted = Arc::clone(&accepted);
                    let open = Arc::clone(&open);
                    tokio::spawn(async move {
                        let mut ws = match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                log::warn!("[MOCK] handshake with {} failed: {}", peer, e);
                                return;
                            }
                        };
                        open.fetch_add(1, Ordering::SeqCst);
                        accepted.fetch_add(1, Ordering::SeqCst);
                        log::info!("[MOCK] monitor client connected: {}", peer);

                        loop {
                            tokio::select! {
                                command = rx.recv() => match command {
                                    Ok(ServerCommand::Push(text)) => {
                                        if ws.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerCommand::DropAll) | Err(broadcast::error::RecvError::Closed) => break,
                                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                                },
                                incoming = ws.next() => match incoming {
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                        }
                        open.fetch_sub(1, Ordering::SeqCst);
                        log::info!("[MOCK] monitor client gone: {}", peer);
                    });
                }
            })
        };

        log::info!("[MOCK] monitor listening on {}", addr);
        Ok(Self {
            addr,
            commands,
            accepted,
            open,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Sends `message` to every open connection; returns how many got it.
    pub fn push(&self, message: &Value) -> usize {
        self.commands
            .send(ServerCommand::Push(message.to_string()))
            .unwrap_or(0)
    }

    pub fn push_raw<S: Into<String>>(&self, text: S) -> usize {
        self.commands.send(ServerCommand::Push(text.into())).unwrap_or(0)
    }

    /// Closes every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(ServerCommand::DropAll);
    }

    /// Total handshakes completed since start.
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn wait_for_accepted(&self, count: usize, timeout: Duration) -> bool {
        crate::test_utils::wait_until(timeout, || self.accepted_connections() >= count).await
    }
}

impl Drop for MockMonitorServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.commands.send(ServerCommand::DropAll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_and_drop() {
        let server = MockMonitorServer::start().await.unwrap();
        let (mut client, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
        assert!(server.wait_for_accepted(1, Duration::from_secs(2)).await);

        assert_eq!(server.push(&serde_json::json!({"type": "hello"})), 1);
        let Some(Ok(Message::Text(text))) = client.next().await else {
            panic!("expected text frame");
        };
        assert!(text.as_str().contains("hello"));

        assert_eq!(server.open_connections(), 1);

        server.drop_connections();
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        assert!(crate::test_utils::wait_until(Duration::from_secs(2), || server.open_connections() == 0).await);
        assert_eq!(server.accepted_connections(), 1);
    }
}
