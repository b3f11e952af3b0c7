//! Coordination server test kit
//!
//! This crate provides test fixtures that stand up an embedded coordination
//! server and hand out connected clients to test cases, tearing both down
//! cleanly afterward.
//!
//! Fixtures running in parallel can share one server per port through the
//! [`SharedResourceRegistry`]: the first fixture to ask for a port starts the
//! server, later fixtures reuse it, and the last one to finish shuts it down.
//!
//! # Example
//!
//! ```no_run
//! use coord_testkit::ServerFixture;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fixture = ServerFixture::with_defaults().start()?;
//!     let client = fixture.client().await?;
//!     client.create("testpath", &[1]).await?;
//!     assert_eq!(client.get_data("testpath").await?, vec![1]);
//!     fixture.finish()?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client for the embedded coordination server.
pub mod client;

/// Configuration: default port, namespaces, TOML server settings.
pub mod config;

/// Error types shared by the registry, policies and fixtures.
pub mod error;

/// Per-test setup/teardown glue.
pub mod fixture;

/// Logging initialization.
pub mod logging;

/// Exclusive and shared acquisition strategies.
pub mod policy;

/// Wire types for the JSON Lines coordination protocol.
pub mod protocol;

/// Reference-counted registry of shared servers.
pub mod registry;

/// Server factory/handle interfaces and their implementations.
pub mod server;

pub use client::{Client, ClientError, ClientState, RetryPolicy};
pub use error::{CreationError, FixtureError, RegistryError, ShutdownError};
pub use fixture::{FixtureConfig, FixtureGuard, ServerFixture};
pub use policy::{Lease, LifecyclePolicy};
pub use registry::SharedResourceRegistry;
pub use server::{EmbeddedServerFactory, ServerFactory, ServerHandle, SharedHandle};

/// A TCP port used as the key of a shared server slot.
///
/// [`Port::AUTO`] (zero) asks the operating system for an ephemeral port.
/// Every other value is a literal port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Port(u16);

impl Port {
    /// Sentinel requesting an OS-assigned port.
    pub const AUTO: Port = Port(0);

    /// Creates a port from a literal number.
    pub const fn new(port: u16) -> Self {
        Self(port)
    }

    /// Returns the raw port number.
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns true for the auto-assign sentinel.
    pub const fn is_auto(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl From<Port> for i64 {
    fn from(port: Port) -> Self {
        i64::from(port.0)
    }
}

impl TryFrom<i64> for Port {
    type Error = config::ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .map(Port)
            .map_err(|_| config::ConfigError::InvalidPort { value })
    }
}
