//! Logging initialization.
//!
//! Configures the `tracing` subscriber with level filtering via the
//! `COORD_TEST_LOG` environment variable. Falls back to `info` level when the
//! variable is unset.
//!
//! ```bash
//! COORD_TEST_LOG=coord_testkit=debug cargo test
//! ```

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding filter directives.
pub const LOG_ENV_VAR: &str = "COORD_TEST_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the tracing subscriber, writing to stderr.
///
/// # Panics
///
/// Panics if a global subscriber has already been set. Test harnesses should
/// use [`try_init`] instead.
pub fn init() {
    fmt()
        .with_env_filter(filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize the tracing subscriber unless one is already installed.
///
/// Output goes through the test writer so it is captured per test.
pub fn try_init() {
    let _ = fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .try_init();
}
