//! TCP accept loop for the embedded server.
//!
//! Each accepted connection is served in its own Tokio task, reading one
//! JSON request per line and writing one JSON response per line.

use std::sync::atomic::Ordering;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use super::handlers::{handle_request, ServerState};
use crate::protocol::{ErrorCode, Request, Response};

/// Listener plus the state shared with every connection.
pub(super) struct NodeServer {
    listener: TcpListener,
    state: ServerState,
}

/// Decrements the active connection count when a handler exits.
struct ConnectionSlot(ServerState);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NodeServer {
    pub(super) fn new(listener: TcpListener, state: ServerState) -> Self {
        Self { listener, state }
    }

    /// Runs the accept loop until a shutdown signal is received.
    pub(super) async fn run_with_shutdown(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::debug!("Server accepting connections");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!("Accepted connection from {}", addr);
                            self.spawn_connection(stream);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream) {
        let state = self.state.clone();
        let active = state.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = ConnectionSlot(state.clone());

        if active > state.settings.max_connections {
            tracing::warn!(
                "Rejecting connection: {} active (limit {})",
                active - 1,
                state.settings.max_connections
            );
            tokio::spawn(async move {
                let _slot = slot;
                let _ = reject_connection(stream).await;
            });
            return;
        }

        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = handle_connection(stream, &state).await {
                tracing::warn!("Connection handler error: {}", e);
            }
        });
    }
}

async fn reject_connection(mut stream: TcpStream) -> std::io::Result<()> {
    let line = Response::error(ErrorCode::TooManyConnections, "too many connections")
        .to_json_line()
        .map_err(std::io::Error::from)?;
    stream.write_all(line.as_bytes()).await?;
    stream.shutdown().await
}

/// Serves a single client connection until it disconnects or goes idle.
async fn handle_connection(stream: TcpStream, state: &ServerState) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = match state.settings.idle_timeout {
            Some(limit) => match timeout(limit, reader.read_line(&mut line)).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!("Closing connection idle for {:?}", limit);
                    break;
                }
            },
            None => reader.read_line(&mut line).await?,
        };

        if bytes_read == 0 {
            tracing::debug!("Client disconnected");
            break;
        }

        let response = match serde_json::from_str::<Request>(line.trim_end()) {
            Ok(req) => handle_request(req, state).await,
            Err(e) => Response::error(ErrorCode::BadRequest, format!("malformed request: {}", e)),
        };

        let out = response.to_json_line().map_err(std::io::Error::from)?;
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
