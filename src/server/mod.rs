//! Server creation interfaces.
//!
//! A [`ServerFactory`] starts servers; each running server is represented by
//! a [`ServerHandle`]. The registry and lifecycle policies only ever talk to
//! these two traits, so tests of the registry can swap in
//! [`fake::FakeServerFactory`] while real fixtures use
//! [`EmbeddedServerFactory`].

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{CreationError, ShutdownError};
use crate::Port;

pub mod embedded;
pub mod fake;
mod handlers;
mod listener;
pub mod store;

pub use embedded::{EmbeddedServer, EmbeddedServerFactory};

/// A live reference to one running server.
pub trait ServerHandle: Send + Sync + Debug {
    /// The port the server is actually listening on.
    ///
    /// Equals the requested port unless the request was [`Port::AUTO`].
    fn bound_port(&self) -> Port;

    /// Stops the server.
    ///
    /// Not required to be idempotent: callers guarantee at most one call.
    fn shutdown(&self) -> Result<(), ShutdownError>;
}

/// Handle type passed between the registry, policies and fixtures.
pub type SharedHandle = Arc<dyn ServerHandle>;

/// Starts servers and owns whatever resources they need on disk.
pub trait ServerFactory: Send + Sync {
    /// Starts a server listening on `port`.
    fn create(&self, port: Port) -> Result<SharedHandle, CreationError>;

    /// Releases resources allocated by earlier `create` calls.
    ///
    /// Best-effort and safe to call multiple times.
    fn cleanup(&self);
}
