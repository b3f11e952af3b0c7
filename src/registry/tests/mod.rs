//! Tests for the SharedResourceRegistry module.
//!
//! Tests are organized into categories:
//! - `basic`: acquire/release bookkeeping on a single thread
//! - `concurrent`: racing acquisitions and releases from many threads
//! - `failure`: creation failures, shutdown failures and illegal releases


use super::SharedResourceRegistry;
use crate::server::fake::FakeServerFactory;
use crate::Port;

/// Literal port used by most tests. Nothing binds it: the factory is fake.
pub(super) const TEST_PORT: Port = Port::new(9510);

/// Helper returning a fresh registry and fake factory.
pub(super) fn registry_and_factory() -> (SharedResourceRegistry, FakeServerFactory) {
    (SharedResourceRegistry::new(), FakeServerFactory::new())
}
