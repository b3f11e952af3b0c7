/// Process-wide defaults: port and namespace.
pub mod defaults;

/// Configuration error types.
pub mod error;

/// Configuration file loader.
pub mod loader;

/// TOML configuration schema types.
pub mod schema;

pub use defaults::{default_port, generate_namespace, DEFAULT_PORT, PORT_ENV_VAR};
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{Config, FixtureSection, ServerConfig, ServerSettings};
