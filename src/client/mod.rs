//! Namespaced client for the embedded coordination server.
//!
//! Every path a [`Client`] is given is resolved under its namespace: with
//! namespace `ns`, `"testpath"` and `"/testpath"` both address `/ns/testpath`
//! on the server. The namespace node itself is created on the first
//! `create`. Fixtures give each client a random namespace so tests sharing
//! one server do not see each other's nodes.
//!
//! Requests on one client are serialized over a single connection. A request
//! that fails with an I/O error is retried on a fresh connection according to
//! the client's [`RetryPolicy`].

pub mod connection;

pub use connection::{ClientError, RetryPolicy};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::protocol::{Op, Request, Response};
use connection::{connect_with_backoff, Connection};

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected and accepting requests.
    Started,
    /// Closed; every request fails with [`ClientError::Closed`].
    Closed,
}

#[derive(Deserialize)]
struct NodeData {
    data: Vec<u8>,
}

#[derive(Deserialize)]
struct SetResult {
    version: u32,
}

#[derive(Debug)]
struct ClientInner {
    addr: SocketAddr,
    namespace: String,
    retry: RetryPolicy,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    namespace_ready: AtomicBool,
}

/// Handle to a server session. Clones share the connection.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects to `addr`, retrying per `retry`.
    ///
    /// An empty `namespace` addresses the server root directly.
    pub async fn connect(
        addr: SocketAddr,
        namespace: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, ClientError> {
        let conn = connect_with_backoff(addr, &retry).await?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                addr,
                namespace: namespace.into(),
                retry,
                conn: Mutex::new(Some(conn)),
                closed: AtomicBool::new(false),
                namespace_ready: AtomicBool::new(false),
            }),
        })
    }

    /// Server address.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Namespace every path is resolved under.
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        if self.inner.closed.load(Ordering::SeqCst) {
            ClientState::Closed
        } else {
            ClientState::Started
        }
    }

    /// Creates a node holding `data`. Its parent must exist, except for the
    /// namespace node, which is created on demand.
    pub async fn create(&self, path: &str, data: &[u8]) -> Result<(), ClientError> {
        self.ensure_namespace().await?;
        let full = self.resolve(path);
        self.expect_ok(&full, Request::new(Op::Create, full.as_str()).with_data(data))
            .await
            .map(drop)
    }

    /// Reads a node's data.
    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let full = self.resolve(path);
        let response = self
            .expect_ok(&full, Request::new(Op::Get, full.as_str()))
            .await?;
        let node: NodeData = serde_json::from_value(response.data.unwrap_or_default())?;
        Ok(node.data)
    }

    /// Overwrites a node's data and returns its new version.
    pub async fn set_data(&self, path: &str, data: &[u8]) -> Result<u32, ClientError> {
        let full = self.resolve(path);
        let response = self
            .expect_ok(&full, Request::new(Op::Set, full.as_str()).with_data(data))
            .await?;
        let result: SetResult = serde_json::from_value(response.data.unwrap_or_default())?;
        Ok(result.version)
    }

    /// Deletes a childless node.
    pub async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let full = self.resolve(path);
        self.expect_ok(&full, Request::new(Op::Delete, full.as_str()))
            .await
            .map(drop)
    }

    /// Whether a node exists.
    pub async fn exists(&self, path: &str) -> Result<bool, ClientError> {
        let full = self.resolve(path);
        let response = self
            .expect_ok(&full, Request::new(Op::Exists, full.as_str()))
            .await?;
        Ok(serde_json::from_value(response.data.unwrap_or_default())?)
    }

    /// Sorted names of a node's direct children.
    pub async fn children(&self, path: &str) -> Result<Vec<String>, ClientError> {
        let full = self.resolve(path);
        let response = self
            .expect_ok(&full, Request::new(Op::Children, full.as_str()))
            .await?;
        Ok(serde_json::from_value(response.data.unwrap_or_default())?)
    }

    /// Round-trips a ping to the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.expect_ok("", Request::new(Op::Ping, "")).await.map(drop)
    }

    /// Closes the client. Idempotent; requests made afterwards fail.
    ///
    /// The connection is dropped immediately unless a request is in flight,
    /// in which case it goes away with the last clone of the client.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut conn) = self.inner.conn.try_lock() {
            conn.take();
        }
        tracing::debug!("Closed client for {}", self.inner.addr);
    }

    /// Absolute server path for a client path.
    fn resolve(&self, path: &str) -> String {
        let relative = path.strip_prefix('/').unwrap_or(path);
        match (self.inner.namespace.is_empty(), relative.is_empty()) {
            (true, true) => "/".to_string(),
            (true, false) => format!("/{}", relative),
            (false, true) => format!("/{}", self.inner.namespace),
            (false, false) => format!("/{}/{}", self.inner.namespace, relative),
        }
    }

    async fn ensure_namespace(&self) -> Result<(), ClientError> {
        if self.inner.namespace.is_empty() || self.inner.namespace_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let root = self.resolve("");
        match self.expect_ok(&root, Request::new(Op::Create, root.as_str())).await {
            Ok(_) | Err(ClientError::NodeExists { .. }) => {
                self.inner.namespace_ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn expect_ok(&self, path: &str, request: Request) -> Result<Response, ClientError> {
        let response = self.execute(&request).await?;
        if response.ok {
            Ok(response)
        } else {
            Err(ClientError::from_response(path, response))
        }
    }

    /// Sends `request`, reconnecting and retrying after I/O failures.
    async fn execute(&self, request: &Request) -> Result<Response, ClientError> {
        let mut conn = self.inner.conn.lock().await;
        let mut attempt = 0;
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                conn.take();
                return Err(ClientError::Closed);
            }

            let result = match conn.as_mut() {
                Some(open) => open.call(request).await,
                None => match connect_with_backoff(self.inner.addr, &RetryPolicy::never()).await
                {
                    Ok(open) => conn.insert(open).call(request).await,
                    Err(ClientError::Connect { source, .. }) => Err(ClientError::Io(source)),
                    Err(e) => Err(e),
                },
            };

            match result {
                Err(ClientError::Io(e)) if attempt < self.inner.retry.max_retries => {
                    conn.take();
                    let delay = self.inner.retry.backoff(attempt);
                    tracing::debug!(
                        "Request to {} failed: {}, retrying in {:?}",
                        self.inner.addr,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e @ ClientError::Io(_)) => {
                    conn.take();
                    return Err(e);
                }
                other => return other,
            }
        }
    }
}
