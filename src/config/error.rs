//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read configuration file: {path}")]
    ReadError {
        /// Path to the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("Invalid configuration at {path}:{line}:{column}: {message}")]
    ParseError {
        /// Path to the file containing the error.
        path: PathBuf,
        /// One-based line index of the error (0 if unknown).
        line: usize,
        /// One-based column index of the error (0 if unknown).
        column: usize,
        /// Human-readable description of the parse failure.
        message: String,
    },

    /// An explicitly requested configuration file does not exist.
    #[error("Configuration file not found: {path}")]
    NotFound {
        /// Path that was requested but does not exist.
        path: PathBuf,
    },

    /// A port number was negative or larger than 65535.
    #[error("Port number must be between 0 and 65535, got {value}")]
    InvalidPort {
        /// The rejected value.
        value: i64,
    },

    /// A duration string could not be parsed.
    #[error("Invalid duration for {field}: '{value}'")]
    InvalidDuration {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Parser error.
        #[source]
        source: humantime::DurationError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_read_error() {
        let err = ConfigError::ReadError {
            path: PathBuf::from("/etc/coord/config.toml"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc/coord/config.toml"));
        assert!(msg.contains("Failed to read"));
    }

    #[test]
    fn display_parse_error() {
        let err = ConfigError::ParseError {
            path: PathBuf::from("config.toml"),
            line: 3,
            column: 9,
            message: "expected `=`".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3:9"), "ParseError should include line:column");
        assert!(msg.contains("expected `=`"));
    }

    #[test]
    fn display_invalid_port() {
        let err = ConfigError::InvalidPort { value: -5 };
        assert!(err.to_string().contains("-5"));
    }

    #[test]
    fn invalid_duration_chains_source() {
        let source = humantime::parse_duration("soon").unwrap_err();
        let err = ConfigError::InvalidDuration {
            field: "idle_timeout",
            value: "soon".to_string(),
            source,
        };
        assert!(err.to_string().contains("idle_timeout"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
