//! Process-wide table of shared servers, keyed by port.
//!
//! [`SharedResourceRegistry`] maps each port to one running server and the
//! number of outstanding acquisitions. A server is created on the first
//! acquire for its port and shut down on the release that drops the count to
//! zero. Every acquire and release, for every port, runs under a single
//! mutex; these calls happen at fixture setup and teardown, so the lost
//! cross-port parallelism does not matter.
//!
//! # Auto-assigned ports
//!
//! [`Port::AUTO`] never names a shared slot. Each auto acquisition creates a
//! new server, which is recorded under the port it actually bound. Callers
//! release it with that bound port, never with `Port::AUTO`.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::{CreationError, RegistryError};
use crate::server::{ServerFactory, SharedHandle};
use crate::Port;

#[cfg(test)]
mod tests;

/// One live shared server and its acquisition count.
///
/// Entries are replaced, never mutated in place.
#[derive(Debug, Clone)]
struct Entry {
    handle: SharedHandle,
    refcount: NonZeroUsize,
}

impl Entry {
    fn new(handle: SharedHandle) -> Self {
        Self {
            handle,
            refcount: NonZeroUsize::MIN,
        }
    }

    fn incremented(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            refcount: self.refcount.saturating_add(1),
        }
    }

    /// Returns `None` when this was the last acquisition.
    fn decremented(&self) -> Option<Self> {
        NonZeroUsize::new(self.refcount.get() - 1).map(|refcount| Self {
            handle: self.handle.clone(),
            refcount,
        })
    }
}

/// Reference-counted table of shared servers.
///
/// Construct one per test suite with [`SharedResourceRegistry::new`] and
/// inject it, or use the process-wide [`SharedResourceRegistry::global`].
#[derive(Debug, Default)]
pub struct SharedResourceRegistry {
    entries: Mutex<HashMap<Port, Entry>>,
}

static GLOBAL: OnceLock<Arc<SharedResourceRegistry>> = OnceLock::new();

impl SharedResourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry shared by every fixture in this process.
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Returns the server for `port`, creating it with `factory` if no entry
    /// exists.
    ///
    /// An existing entry is reused and `factory` is not called. If creation
    /// fails the registry is left untouched. For [`Port::AUTO`] a new server
    /// is always created and recorded under its bound port. A literal port is
    /// always recorded under itself, whatever port the server reports.
    pub fn acquire(
        &self,
        port: Port,
        factory: &dyn ServerFactory,
    ) -> Result<SharedHandle, RegistryError> {
        let mut entries = self.lock();

        if !port.is_auto() {
            if let Some(entry) = entries.get(&port) {
                let next = entry.incremented();
                tracing::debug!(
                    "Using existing server at port {} (refcount {})",
                    port,
                    next.refcount
                );
                let handle = next.handle.clone();
                entries.insert(port, next);
                return Ok(handle);
            }
        }

        tracing::debug!("Starting new server at port {}", port);
        let handle = factory.create(port)?;
        let bound = handle.bound_port();
        if !port.is_auto() {
            if bound != port {
                tracing::warn!("Server requested at port {} bound port {}", port, bound);
            }
            entries.insert(port, Entry::new(handle.clone()));
            return Ok(handle);
        }

        if entries.contains_key(&bound) {
            // Only a misbehaving factory can reuse a port one of our servers
            // still holds. Refuse rather than merge two servers into one slot.
            if let Err(e) = handle.shutdown() {
                tracing::warn!("Failed to stop duplicate server on port {}: {}", bound, e);
            }
            return Err(CreationError::Refused {
                port: bound,
                reason: "auto-assigned port is already registered".to_string(),
            }
            .into());
        }

        entries.insert(bound, Entry::new(handle.clone()));
        Ok(handle)
    }

    /// Registry key for an acquisition of `requested` that produced `handle`.
    ///
    /// Literal ports are their own key; [`Port::AUTO`] is keyed by the bound
    /// port.
    pub fn key_for(requested: Port, handle: &SharedHandle) -> Port {
        if requested.is_auto() {
            handle.bound_port()
        } else {
            requested
        }
    }

    /// Drops one acquisition of `port`, shutting the server down when it was
    /// the last.
    ///
    /// Releasing a port with no entry is a caller bug and returns
    /// [`RegistryError::IllegalRelease`]. A failed shutdown is returned too,
    /// but the entry is removed first.
    pub fn release(&self, port: Port) -> Result<(), RegistryError> {
        let mut entries = self.lock();

        let Some(entry) = entries.remove(&port) else {
            tracing::error!("Release of port {} which holds no acquired server", port);
            return Err(RegistryError::IllegalRelease { port });
        };

        match entry.decremented() {
            Some(next) => {
                tracing::debug!(
                    "Keeping server at port {} (refcount {})",
                    port,
                    next.refcount
                );
                entries.insert(port, next);
                Ok(())
            }
            None => {
                tracing::debug!("Closing server at port {}", port);
                entry.handle.shutdown().map_err(|e| {
                    tracing::warn!("Server at port {} failed to shut down: {}", port, e);
                    RegistryError::from(e)
                })
            }
        }
    }

    /// Outstanding acquisitions of `port`, or 0 if it has no entry.
    pub fn refcount(&self, port: Port) -> usize {
        self.lock()
            .get(&port)
            .map_or(0, |entry| entry.refcount.get())
    }

    /// Whether `port` has a live entry.
    pub fn contains(&self, port: Port) -> bool {
        self.lock().contains_key(&port)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry holds no servers.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Port, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
