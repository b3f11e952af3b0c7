//! TOML configuration schema types.
//!
//! All structs derive `Deserialize` and `Serialize` with defaults via
//! `#[serde(default)]`, so an empty file is a valid configuration.
//!
//! Duration fields use human-readable strings (e.g. `"10m"`, `"500ms"`)
//! parsed by the `humantime` crate when converted to [`ServerSettings`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::error::ConfigError;
use crate::Port;

/// Root configuration.
///
/// ```toml
/// [server]
/// [fixture]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Embedded server tuning.
    pub server: ServerConfig,
    /// Fixture defaults.
    pub fixture: FixtureSection,
}

/// Embedded server settings as written in TOML.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Delete data and snapshot directories on factory cleanup.
    pub cleanup_on_exit: bool,
    /// Maximum concurrent client connections per server.
    pub max_connections: usize,
    /// Close client connections idle for longer than this (e.g. `"10m"`).
    /// `"0s"` disables the limit.
    pub idle_timeout: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cleanup_on_exit: false,
            max_connections: 60,
            idle_timeout: "10m".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validates the raw values and converts them to [`ServerSettings`].
    pub fn settings(&self) -> Result<ServerSettings, ConfigError> {
        let idle_timeout = humantime::parse_duration(&self.idle_timeout).map_err(|source| {
            ConfigError::InvalidDuration {
                field: "idle_timeout",
                value: self.idle_timeout.clone(),
                source,
            }
        })?;
        Ok(ServerSettings {
            cleanup_on_exit: self.cleanup_on_exit,
            max_connections: self.max_connections,
            idle_timeout: (!idle_timeout.is_zero()).then_some(idle_timeout),
        })
    }
}

/// Validated embedded server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Delete data and snapshot directories on factory cleanup.
    pub cleanup_on_exit: bool,
    /// Maximum concurrent client connections per server.
    pub max_connections: usize,
    /// Idle limit for client connections, `None` when disabled.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            cleanup_on_exit: false,
            max_connections: 60,
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Fixture defaults as written in TOML.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FixtureSection {
    /// Port to use; falls back to `COORD_TEST_PORT` / 9500 when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,
    /// Namespace to use; a random one is generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}
