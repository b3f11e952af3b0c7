//! Process-wide fixture defaults.
//!
//! The default port can be overridden with the `COORD_TEST_PORT` environment
//! variable; namespaces default to a random UUID so fixtures sharing a server
//! never see each other's nodes.

use crate::Port;

/// Port used when `COORD_TEST_PORT` is not set.
pub const DEFAULT_PORT: Port = Port::new(9500);

/// Environment variable overriding [`DEFAULT_PORT`].
pub const PORT_ENV_VAR: &str = "COORD_TEST_PORT";

/// Returns the default fixture port.
///
/// Reads [`PORT_ENV_VAR`]. Values that are not integers in `0..=65535` are
/// logged and ignored.
pub fn default_port() -> Port {
    match std::env::var(PORT_ENV_VAR) {
        Ok(raw) => parse_port(&raw).unwrap_or_else(|| {
            tracing::warn!(
                "Ignoring invalid {}={:?}, using port {}",
                PORT_ENV_VAR,
                raw,
                DEFAULT_PORT
            );
            DEFAULT_PORT
        }),
        Err(_) => DEFAULT_PORT,
    }
}

fn parse_port(raw: &str) -> Option<Port> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|value| Port::try_from(value).ok())
}

/// Generates a random namespace for a fixture.
pub fn generate_namespace() -> String {
    uuid::Uuid::new_v4().to_string()
}
