//! Line-framed TCP connection to the embedded server, with connect retries.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::protocol::{ErrorCode, Request, Response};

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Error types for client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No connection could be established within the retry budget.
    #[error("Failed to connect to {addr} after {attempts} attempts")]
    Connect {
        /// Server address.
        addr: SocketAddr,
        /// Connection attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: std::io::Error,
    },

    /// The connection broke mid-request.
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The node does not exist.
    #[error("No node: {path}")]
    NoNode {
        /// Absolute path on the server.
        path: String,
    },

    /// A node already exists at the path.
    #[error("Node already exists: {path}")]
    NodeExists {
        /// Absolute path on the server.
        path: String,
    },

    /// The node still has children.
    #[error("Node has children: {path}")]
    NotEmpty {
        /// Absolute path on the server.
        path: String,
    },

    /// Any other error reported by the server.
    #[error("Server error: {message}")]
    Server {
        /// Failure category, if the server sent one.
        code: Option<ErrorCode>,
        /// Server-provided message.
        message: String,
    },

    /// The client was closed.
    #[error("Client is closed")]
    Closed,
}

impl ClientError {
    /// Converts a failed response for `path` into an error.
    pub(super) fn from_response(path: &str, response: Response) -> Self {
        let path = path.to_string();
        match response.code {
            Some(ErrorCode::NoNode) => ClientError::NoNode { path },
            Some(ErrorCode::NodeExists) => ClientError::NodeExists { path },
            Some(ErrorCode::NotEmpty) => ClientError::NotEmpty { path },
            code => ClientError::Server {
                code,
                message: response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }
}

/// Exponential backoff for connecting and for retrying broken requests.
///
/// The sleep before retry `n` (zero-indexed) is `base_sleep * 2^n`, capped
/// at 30 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep before the first retry.
    pub base_sleep: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Creates a policy.
    pub const fn new(base_sleep: Duration, max_retries: u32) -> Self {
        Self {
            base_sleep,
            max_retries,
        }
    }

    /// A policy that never retries.
    pub const fn never() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Sleep before the zero-indexed retry `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_sleep
            .saturating_mul(factor)
            .min(Duration::from_millis(MAX_BACKOFF_MS))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 3)
    }
}

/// One open connection: requests go out as JSON lines, responses come back
/// one line each.
#[derive(Debug)]
pub(super) struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Sends one request and waits for its response.
    pub(super) async fn call(&mut self, request: &Request) -> Result<Response, ClientError> {
        let line = request.to_json_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut buf = String::new();
        if self.reader.read_line(&mut buf).await? == 0 {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        Ok(serde_json::from_str(buf.trim_end())?)
    }
}

/// Connects to `addr`, retrying with exponential backoff.
pub(super) async fn connect_with_backoff(
    addr: SocketAddr,
    policy: &RetryPolicy,
) -> Result<Connection, ClientError> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if attempt > 0 {
                    tracing::info!("Connected to {} after {} retries", addr, attempt);
                } else {
                    tracing::debug!("Connected to {}", addr);
                }
                return Ok(Connection::new(stream));
            }
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    "Connection attempt {} to {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    addr,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(ClientError::Connect {
                    addr,
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_sleep, Duration::from_millis(1000));
        assert_eq!(policy.max_retries, 3);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::new(Duration::from_millis(10), 10);
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert_eq!(policy.backoff(5), Duration::from_millis(320));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(policy.backoff(40), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_error_from_response_codes() {
        let err = ClientError::from_response("/a", Response::error(ErrorCode::NoNode, "x"));
        assert!(matches!(err, ClientError::NoNode { ref path } if path == "/a"));

        let err = ClientError::from_response("/a", Response::error(ErrorCode::BadRequest, "bad"));
        assert!(matches!(
            err,
            ClientError::Server { code: Some(ErrorCode::BadRequest), ref message } if message == "bad"
        ));
    }

    #[test]
    fn test_connect_error_has_source() {
        let err = ClientError::Connect {
            addr: "127.0.0.1:1".parse().unwrap(),
            attempts: 4,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_client_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<ClientError>();
        assert_sync::<ClientError>();
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_retries() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let policy = RetryPolicy::new(Duration::from_millis(1), 2);

        let err = connect_with_backoff(addr, &policy).await.unwrap_err();

        assert!(matches!(err, ClientError::Connect { attempts: 3, .. }));
    }
}
