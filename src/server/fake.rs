//! In-memory [`ServerFactory`] for exercising the registry and policies
//! without sockets.
//!
//! The fake records every create, shutdown and cleanup call, hands out
//! distinct ports for [`Port::AUTO`], and refuses a literal port that one of
//! its servers already holds, the way a second bind would fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ServerFactory, ServerHandle, SharedHandle};
use crate::error::{CreationError, ShutdownError};
use crate::Port;

/// First port handed out for auto-assign requests.
pub const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Debug, Default)]
struct FakeState {
    bound: HashSet<Port>,
    creates: HashMap<Port, usize>,
    shutdowns: HashMap<Port, usize>,
    cleanups: usize,
    next_ephemeral: u16,
    fail_create: bool,
    fail_shutdown: bool,
}

impl FakeState {
    fn allocate_ephemeral(&mut self) -> Option<Port> {
        let start = self.next_ephemeral.max(FIRST_EPHEMERAL_PORT);
        let candidate = (start..=u16::MAX)
            .chain(FIRST_EPHEMERAL_PORT..start)
            .find(|&candidate| !self.bound.contains(&Port::new(candidate)))?;
        self.next_ephemeral = candidate.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        Some(Port::new(candidate))
    }
}

/// Fake server factory. Cloning shares the recorded state.
#[derive(Debug, Clone, Default)]
pub struct FakeServerFactory {
    state: Arc<Mutex<FakeState>>,
    create_delay: Option<Duration>,
}

impl FakeServerFactory {
    /// Creates a factory with no recorded calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` inside every `create`, widening race windows.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Makes subsequent `create` calls fail (or succeed again).
    pub fn set_fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Makes subsequent `shutdown` calls report failure (or succeed again).
    pub fn set_fail_shutdown(&self, fail: bool) {
        self.lock().fail_shutdown = fail;
    }

    /// Number of successful `create` calls for the requested port.
    pub fn create_count(&self, requested: Port) -> usize {
        self.lock().creates.get(&requested).copied().unwrap_or(0)
    }

    /// Number of successful `create` calls across all ports.
    pub fn total_creates(&self) -> usize {
        self.lock().creates.values().sum()
    }

    /// Number of `shutdown` calls for servers bound to `bound`.
    pub fn shutdown_count(&self, bound: Port) -> usize {
        self.lock().shutdowns.get(&bound).copied().unwrap_or(0)
    }

    /// Number of `shutdown` calls across all ports.
    pub fn total_shutdowns(&self) -> usize {
        self.lock().shutdowns.values().sum()
    }

    /// Number of `cleanup` calls.
    pub fn cleanup_count(&self) -> usize {
        self.lock().cleanups
    }

    /// Whether a live fake server holds `port`.
    pub fn is_bound(&self, port: Port) -> bool {
        self.lock().bound.contains(&port)
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerFactory for FakeServerFactory {
    fn create(&self, port: Port) -> Result<SharedHandle, CreationError> {
        if let Some(delay) = self.create_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.lock();
        if state.fail_create {
            return Err(CreationError::Refused {
                port,
                reason: "fake factory configured to fail".to_string(),
            });
        }

        let bound = if port.is_auto() {
            state.allocate_ephemeral().ok_or_else(|| CreationError::Refused {
                port,
                reason: "no ephemeral ports left".to_string(),
            })?
        } else if state.bound.contains(&port) {
            return Err(CreationError::Bind {
                port,
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "address already in use",
                ),
            });
        } else {
            port
        };

        state.bound.insert(bound);
        *state.creates.entry(port).or_insert(0) += 1;

        Ok(Arc::new(FakeServer {
            port: bound,
            state: self.state.clone(),
            shut_down: AtomicBool::new(false),
        }))
    }

    fn cleanup(&self) {
        self.lock().cleanups += 1;
    }
}

/// Handle produced by [`FakeServerFactory`].
#[derive(Debug)]
pub struct FakeServer {
    port: Port,
    state: Arc<Mutex<FakeState>>,
    shut_down: AtomicBool,
}

impl ServerHandle for FakeServer {
    fn bound_port(&self) -> Port {
        self.port
    }

    fn shutdown(&self) -> Result<(), ShutdownError> {
        let already = self.shut_down.swap(true, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state.shutdowns.entry(self.port).or_insert(0) += 1;
        if already {
            return Err(ShutdownError::Refused {
                port: self.port,
                reason: "shutdown called twice".to_string(),
            });
        }
        state.bound.remove(&self.port);
        if state.fail_shutdown {
            return Err(ShutdownError::Refused {
                port: self.port,
                reason: "fake factory configured to fail".to_string(),
            });
        }
        Ok(())
    }
}
