//! Strategies for obtaining a server at fixture setup.
//!
//! [`LifecyclePolicy::Exclusive`] starts a private server for every
//! acquisition and performs no collision detection: two exclusive fixtures on
//! the same literal port fail the way a second bind fails.
//! [`LifecyclePolicy::Shared`] goes through a [`SharedResourceRegistry`], so
//! fixtures naming the same port get the same server.

use std::fmt;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::registry::SharedResourceRegistry;
use crate::server::{ServerFactory, SharedHandle};
use crate::Port;

/// How a fixture obtains its server.
#[derive(Clone)]
pub enum LifecyclePolicy {
    /// A private server per fixture, shut down on release.
    Exclusive,
    /// One reference-counted server per port, held in the given registry.
    Shared(Arc<SharedResourceRegistry>),
}

impl LifecyclePolicy {
    /// Shared policy backed by the process-wide registry.
    pub fn shared() -> Self {
        Self::Shared(SharedResourceRegistry::global())
    }

    /// Shared policy backed by a caller-owned registry.
    pub fn shared_in(registry: Arc<SharedResourceRegistry>) -> Self {
        Self::Shared(registry)
    }

    /// Whether this is the shared variant.
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Obtains a server for `port`.
    ///
    /// The returned [`Lease`] must be released exactly once.
    pub fn acquire(&self, port: Port, factory: &dyn ServerFactory) -> Result<Lease, RegistryError> {
        let handle = match self {
            Self::Exclusive => factory.create(port)?,
            Self::Shared(registry) => registry.acquire(port, factory)?,
        };
        Ok(Lease {
            key: SharedResourceRegistry::key_for(port, &handle),
            handle,
            policy: self.clone(),
        })
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::shared()
    }
}

impl fmt::Debug for LifecyclePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => f.write_str("Exclusive"),
            Self::Shared(registry) => f
                .debug_tuple("Shared")
                .field(&format_args!("{} entries", registry.len()))
                .finish(),
        }
    }
}

/// One acquisition of a server, returned by [`LifecyclePolicy::acquire`].
///
/// Dropping a lease without calling [`Lease::release`] leaves the server
/// running.
#[derive(Debug)]
#[must_use = "a lease must be released to stop its server"]
pub struct Lease {
    key: Port,
    handle: SharedHandle,
    policy: LifecyclePolicy,
}

impl Lease {
    /// The server behind this lease.
    pub fn handle(&self) -> &SharedHandle {
        &self.handle
    }

    /// Port the server listens on.
    pub fn bound_port(&self) -> Port {
        self.handle.bound_port()
    }

    /// Registry key the lease releases: the requested port, or the bound port
    /// for auto-port acquisitions so they release the slot they created.
    pub fn key(&self) -> Port {
        self.key
    }

    /// Gives the server back.
    ///
    /// Exclusive leases shut their server down. Shared leases drop one
    /// reference, and the registry shuts the server down on the last one.
    pub fn release(self) -> Result<(), RegistryError> {
        match &self.policy {
            LifecyclePolicy::Exclusive => {
                tracing::debug!("Closing exclusive server at port {}", self.key);
                self.handle.shutdown().map_err(RegistryError::from)
            }
            LifecyclePolicy::Shared(registry) => registry.release(self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CreationError;
    use crate::server::fake::FakeServerFactory;

    const PORT: Port = Port::new(9500);

    #[test]
    fn test_exclusive_double_bind_fails_until_release() {
        let factory = FakeServerFactory::new();
        let policy = LifecyclePolicy::Exclusive;

        let a = policy.acquire(PORT, &factory).unwrap();
        let err = policy.acquire(PORT, &factory).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Creation(CreationError::Bind { .. })
        ));

        a.release().unwrap();
        let again = policy.acquire(PORT, &factory).unwrap();
        assert_eq!(again.bound_port(), PORT);
        again.release().unwrap();
        assert_eq!(factory.shutdown_count(PORT), 2);
    }

    #[test]
    fn test_exclusive_does_not_touch_registry() {
        let registry = Arc::new(SharedResourceRegistry::new());
        let factory = FakeServerFactory::new();

        let lease = LifecyclePolicy::Exclusive.acquire(PORT, &factory).unwrap();
        assert!(registry.is_empty());
        lease.release().unwrap();
    }

    #[test]
    fn test_shared_end_to_end() {
        let registry = Arc::new(SharedResourceRegistry::new());
        let policy = LifecyclePolicy::shared_in(registry.clone());
        let factory = FakeServerFactory::new();
        let port = Port::new(9510);

        let a = policy.acquire(port, &factory).unwrap();
        assert_eq!(factory.create_count(port), 1);
        assert_eq!(registry.refcount(port), 1);

        let b = policy.acquire(port, &factory).unwrap();
        assert_eq!(factory.create_count(port), 1);
        assert_eq!(registry.refcount(port), 2);
        assert_eq!(a.bound_port(), b.bound_port());

        b.release().unwrap();
        assert_eq!(registry.refcount(port), 1);
        assert_eq!(factory.shutdown_count(port), 0);

        a.release().unwrap();
        assert_eq!(registry.refcount(port), 0);
        assert_eq!(factory.shutdown_count(port), 1);
    }

    #[test]
    fn test_shared_auto_leases_get_distinct_ports() {
        let registry = Arc::new(SharedResourceRegistry::new());
        let policy = LifecyclePolicy::shared_in(registry.clone());
        let factory = FakeServerFactory::new();

        let a = policy.acquire(Port::AUTO, &factory).unwrap();
        let b = policy.acquire(Port::AUTO, &factory).unwrap();
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a.bound_port());
        assert_eq!(a.handle().bound_port(), a.key());
        assert_eq!(registry.refcount(b.handle().bound_port()), 1);

        a.release().unwrap();
        b.release().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_default_is_shared() {
        assert!(LifecyclePolicy::default().is_shared());
        assert!(!LifecyclePolicy::Exclusive.is_shared());
    }

    #[test]
    fn test_debug_output() {
        assert_eq!(format!("{:?}", LifecyclePolicy::Exclusive), "Exclusive");
        let shared = LifecyclePolicy::shared_in(Arc::new(SharedResourceRegistry::new()));
        assert_eq!(format!("{:?}", shared), "Shared(0 entries)");
    }
}
