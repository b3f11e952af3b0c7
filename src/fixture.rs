//! Per-test setup and teardown around a server and its clients.
//!
//! A [`ServerFixture`] acquires a server in [`before`](ServerFixture::before)
//! according to its [`LifecyclePolicy`], hands out namespaced clients, and in
//! [`after`](ServerFixture::after) closes those clients, releases the server
//! and asks the factory to clean up. [`ServerFixture::start`] wraps both in a
//! guard that tears down on drop.

use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::client::{Client, ClientState, RetryPolicy};
use crate::config::{default_port, generate_namespace, Config, ConfigError, FixtureSection};
use crate::error::FixtureError;
use crate::policy::{Lease, LifecyclePolicy};
use crate::server::{EmbeddedServerFactory, ServerFactory};
use crate::Port;

/// Which server a fixture uses and how clients are isolated on it.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Requested port; [`Port::AUTO`] asks for an OS-assigned one.
    pub port: Port,
    /// Namespace client paths are resolved under.
    pub namespace: String,
    /// Exclusive or shared acquisition.
    pub policy: LifecyclePolicy,
}

impl Default for FixtureConfig {
    /// Default port, random namespace, shared through the global registry.
    fn default() -> Self {
        Self {
            port: default_port(),
            namespace: generate_namespace(),
            policy: LifecyclePolicy::shared(),
        }
    }
}

impl FixtureConfig {
    /// Creates a config with explicit values.
    pub fn new(port: Port, namespace: impl Into<String>, policy: LifecyclePolicy) -> Self {
        Self {
            port,
            namespace: namespace.into(),
            policy,
        }
    }

    /// Fills unset fields of a `[fixture]` section with defaults.
    pub fn from_section(section: &FixtureSection) -> Self {
        let mut config = Self::default();
        if let Some(port) = section.port {
            config.port = port;
        }
        if let Some(namespace) = &section.namespace {
            config.namespace = namespace.clone();
        }
        config
    }

    /// Sets the port.
    pub fn with_port(mut self, port: Port) -> Self {
        self.port = port;
        self
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the policy.
    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses a private server.
    pub fn exclusive(self) -> Self {
        self.with_policy(LifecyclePolicy::Exclusive)
    }

    /// Shares the server through the global registry.
    pub fn shared(self) -> Self {
        self.with_policy(LifecyclePolicy::shared())
    }
}

/// Setup/teardown object for one test.
pub struct ServerFixture {
    config: FixtureConfig,
    factory: Arc<dyn ServerFactory>,
    lease: Mutex<Option<Lease>>,
    clients: Mutex<Vec<Client>>,
}

impl ServerFixture {
    /// Creates a fixture. No server is started until [`before`](Self::before).
    pub fn new(config: FixtureConfig, factory: Arc<dyn ServerFactory>) -> Self {
        tracing::debug!(
            "Creating fixture with namespace {}, port {}, policy {:?}",
            config.namespace,
            config.port,
            config.policy
        );
        Self {
            config,
            factory,
            lease: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Default config with an [`EmbeddedServerFactory`] that keeps its
    /// temporary directories.
    pub fn with_defaults() -> Self {
        Self::new(
            FixtureConfig::default(),
            Arc::new(EmbeddedServerFactory::default()),
        )
    }

    /// Builds a fixture from a loaded configuration file.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let settings = config.server.settings()?;
        Ok(Self::new(
            FixtureConfig::from_section(&config.fixture),
            Arc::new(EmbeddedServerFactory::new(settings)),
        ))
    }

    /// Acquires the server.
    pub fn before(&self) -> Result<(), FixtureError> {
        let mut lease = self.lock_lease();
        if let Some(held) = lease.as_ref() {
            return Err(FixtureError::AlreadyStarted {
                port: held.bound_port(),
            });
        }
        let acquired = self
            .config
            .policy
            .acquire(self.config.port, self.factory.as_ref())?;
        tracing::debug!(
            "Fixture {} acquired server at port {}",
            self.config.namespace,
            acquired.bound_port()
        );
        *lease = Some(acquired);
        Ok(())
    }

    /// Closes clients, releases the server, then runs factory cleanup.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned.
    pub fn after(&self) -> Result<(), FixtureError> {
        self.close_clients();

        let lease = self.lock_lease().take();
        let released = match lease {
            Some(lease) => lease.release().map_err(FixtureError::from),
            None => {
                tracing::warn!(
                    "Cannot close server at port {}, it likely had trouble starting",
                    self.config.port
                );
                Ok(())
            }
        };

        self.factory.cleanup();
        released
    }

    /// Acquires the server and returns a guard that releases it on drop.
    pub fn start(self) -> Result<FixtureGuard, FixtureError> {
        self.before()?;
        Ok(FixtureGuard {
            fixture: self,
            finished: false,
        })
    }

    /// Connects a new client with the default [`RetryPolicy`].
    pub async fn client(&self) -> Result<Client, FixtureError> {
        self.client_with_retry(RetryPolicy::default()).await
    }

    /// Connects a new client. It is closed by [`after`](Self::after).
    pub async fn client_with_retry(&self, retry: RetryPolicy) -> Result<Client, FixtureError> {
        let addr = self.local_addr()?;
        let client = Client::connect(addr, self.config.namespace.clone(), retry).await?;
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client.clone());
        Ok(client)
    }

    /// Port the acquired server listens on.
    pub fn bound_port(&self) -> Result<Port, FixtureError> {
        self.lock_lease()
            .as_ref()
            .map(Lease::bound_port)
            .ok_or(FixtureError::NotStarted)
    }

    /// `127.0.0.1:<port>` of the acquired server.
    pub fn connect_string(&self) -> Result<String, FixtureError> {
        self.local_addr().map(|addr| addr.to_string())
    }

    /// Namespace of clients created by this fixture.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Requested port, which is [`Port::AUTO`] for OS-assigned servers.
    pub fn port(&self) -> Port {
        self.config.port
    }

    /// Fixture configuration.
    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    fn local_addr(&self) -> Result<SocketAddr, FixtureError> {
        self.bound_port()
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port.get())))
    }

    fn close_clients(&self) {
        let clients = std::mem::take(
            &mut *self
                .clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::debug!("Closing {} clients", clients.len());
        for client in clients {
            if client.state() == ClientState::Started {
                client.close();
            }
        }
    }

    fn lock_lease(&self) -> MutexGuard<'_, Option<Lease>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ServerFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFixture")
            .field("config", &self.config)
            .field("bound_port", &self.bound_port().ok())
            .finish_non_exhaustive()
    }
}

/// A started fixture. Runs [`ServerFixture::after`] when dropped.
///
/// Use [`finish`](FixtureGuard::finish) to see teardown errors; drop only
/// logs them.
#[derive(Debug)]
pub struct FixtureGuard {
    fixture: ServerFixture,
    finished: bool,
}

impl FixtureGuard {
    /// Tears the fixture down and returns the result.
    pub fn finish(mut self) -> Result<(), FixtureError> {
        self.finished = true;
        self.fixture.after()
    }
}

impl Deref for FixtureGuard {
    type Target = ServerFixture;

    fn deref(&self) -> &ServerFixture {
        &self.fixture
    }
}

impl Drop for FixtureGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.fixture.after() {
            tracing::warn!("Fixture teardown failed: {}", e);
        }
    }
}
