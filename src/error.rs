//! Error types for server creation, registry bookkeeping and fixtures.

use crate::client::ClientError;
use crate::Port;
use thiserror::Error;

/// A server factory could not start a server.
#[derive(Error, Debug)]
pub enum CreationError {
    /// The listener could not bind to the requested port (usually already in use).
    #[error("Failed to bind server to port {port}")]
    Bind {
        /// Requested port.
        port: Port,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Data or snapshot directories could not be prepared.
    #[error("Failed to prepare server storage")]
    Storage {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The runtime or thread serving the listener could not be started.
    #[error("Failed to start server runtime")]
    Runtime {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The factory declined to create a server.
    #[error("Server creation refused on port {port}: {reason}")]
    Refused {
        /// Requested port.
        port: Port,
        /// Why the factory refused.
        reason: String,
    },
}

/// A running server could not be shut down cleanly.
#[derive(Error, Debug)]
pub enum ShutdownError {
    /// The thread serving the listener panicked.
    #[error("Server thread for port {port} panicked")]
    Join {
        /// Bound port of the server.
        port: Port,
    },

    /// The final snapshot of the node tree could not be written.
    #[error("Failed to write snapshot for server on port {port}")]
    Snapshot {
        /// Bound port of the server.
        port: Port,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The handle refused to shut down.
    #[error("Server shutdown refused on port {port}: {reason}")]
    Refused {
        /// Bound port of the server.
        port: Port,
        /// Why shutdown failed.
        reason: String,
    },
}

/// Errors raised while acquiring or releasing a server.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The factory failed to create a server. Nothing was recorded.
    #[error(transparent)]
    Creation(#[from] CreationError),

    /// `release` was called for a port with no live entry.
    #[error("Release of port {port} which holds no acquired server")]
    IllegalRelease {
        /// Port that was released.
        port: Port,
    },

    /// The last release shut the server down, and shutdown failed.
    /// The entry has been removed regardless.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Errors surfaced by [`ServerFixture`](crate::ServerFixture).
#[derive(Error, Debug)]
pub enum FixtureError {
    /// The fixture has no server: `before()` was not called or failed.
    #[error("Fixture has no running server; call before() first")]
    NotStarted,

    /// `before()` was called twice without an intervening `after()`.
    #[error("Fixture already holds a server on port {port}")]
    AlreadyStarted {
        /// Bound port of the held server.
        port: Port,
    },

    /// Acquiring or releasing the server failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Creating a client failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}
