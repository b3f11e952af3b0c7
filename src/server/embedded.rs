//! Embedded coordination server and its factory.
//!
//! [`EmbeddedServerFactory::create`] binds the listener synchronously, so a
//! port that is already taken fails the call immediately, then serves the
//! protocol from a dedicated thread running a current-thread Tokio runtime.
//! Each server gets its own data directory (transaction log) and snapshot
//! directory (node tree written on shutdown).

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::handlers::{ServerState, TxnLog};
use super::listener::NodeServer;
use super::store::NodeStore;
use super::{ServerFactory, ServerHandle, SharedHandle};
use crate::config::ServerSettings;
use crate::error::{CreationError, ShutdownError};
use crate::Port;

/// File name of the transaction log inside the data directory.
pub const TXN_LOG_FILE: &str = "txn.log";

/// File name of the node tree snapshot inside the snapshot directory.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// A running embedded server.
#[derive(Debug)]
pub struct EmbeddedServer {
    port: Port,
    data_dir: PathBuf,
    snapshot_dir: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    thread: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    stopped: Arc<AtomicBool>,
}

impl EmbeddedServer {
    fn start(
        requested: Port,
        data_dir: PathBuf,
        snapshot_dir: PathBuf,
        settings: ServerSettings,
    ) -> Result<Self, CreationError> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, requested.get()))
            .map_err(|source| CreationError::Bind {
                port: requested,
                source,
            })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| CreationError::Runtime { source })?;
        let port = listener
            .local_addr()
            .map(|addr| Port::new(addr.port()))
            .map_err(|source| CreationError::Runtime { source })?;

        let txn_log = TxnLog::open(&data_dir.join(TXN_LOG_FILE))
            .map_err(|source| CreationError::Storage { source })?;
        let state = ServerState {
            store: NodeStore::new(),
            txn_log: Arc::new(txn_log),
            active_connections: Arc::new(AtomicUsize::new(0)),
            settings,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| CreationError::Runtime { source })?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::io::Result<()>>(1);
        let snapshot_path = snapshot_dir.join(SNAPSHOT_FILE);

        let thread = thread::Builder::new()
            .name(format!("coord-server-{}", port))
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(listener) {
                        Ok(listener) => {
                            let _ = ready_tx.send(Ok(()));
                            listener
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(());
                        }
                    };
                    let server = NodeServer::new(listener, state.clone());
                    server.run_with_shutdown(shutdown_rx).await;
                    write_snapshot(&state.store, &snapshot_path).await
                })
            })
            .map_err(|source| CreationError::Runtime { source })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let _ = thread.join();
                return Err(CreationError::Runtime { source });
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CreationError::Runtime {
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "server thread exited before accepting connections",
                    ),
                });
            }
        }

        Ok(Self {
            port,
            data_dir,
            snapshot_dir,
            shutdown_tx,
            thread: Mutex::new(Some(thread)),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Loopback address clients should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port.get()))
    }

    /// Directory holding the transaction log.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory the snapshot is written to on shutdown.
    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Whether `shutdown` has completed.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ServerHandle for EmbeddedServer {
    fn bound_port(&self) -> Port {
        self.port
    }

    fn shutdown(&self) -> Result<(), ShutdownError> {
        tracing::debug!("Shutting down server at port {}", self.port);
        let _ = self.shutdown_tx.send(());
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match thread {
            Some(thread) => match thread.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(ShutdownError::Snapshot {
                    port: self.port,
                    source,
                }),
                Err(_) => Err(ShutdownError::Join { port: self.port }),
            },
            None => Ok(()),
        };
        self.stopped.store(true, Ordering::SeqCst);
        result
    }
}

impl Drop for EmbeddedServer {
    /// Signals the server thread to stop if nobody shut it down (best-effort).
    fn drop(&mut self) {
        if !self.is_stopped() {
            tracing::debug!("Server at port {} dropped while running", self.port);
            let _ = self.shutdown_tx.send(());
        }
    }
}

async fn write_snapshot(store: &NodeStore, path: &Path) -> std::io::Result<()> {
    let snapshot = store.snapshot().await;
    let bytes = serde_json::to_vec_pretty(&snapshot).map_err(std::io::Error::from)?;
    std::fs::write(path, bytes)
}

/// Directories created for one server, removable once it has stopped.
#[derive(Debug)]
struct Allocation {
    dirs: [PathBuf; 2],
    stopped: Arc<AtomicBool>,
}

/// Production [`ServerFactory`] starting [`EmbeddedServer`]s.
///
/// With `cleanup_on_exit` set, the factory remembers the directories it
/// created and deletes those of stopped servers on [`cleanup`]; directories
/// of servers still running (shared with other fixtures) are kept for a
/// later call. Otherwise directories are left on disk for inspection.
///
/// [`cleanup`]: ServerFactory::cleanup
#[derive(Debug, Default)]
pub struct EmbeddedServerFactory {
    settings: ServerSettings,
    allocations: Mutex<Vec<Allocation>>,
}

impl EmbeddedServerFactory {
    /// Creates a factory with the given settings.
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            allocations: Mutex::new(Vec::new()),
        }
    }

    /// Creates a factory with default settings and the given cleanup behavior.
    pub fn with_cleanup(cleanup_on_exit: bool) -> Self {
        Self::new(ServerSettings {
            cleanup_on_exit,
            ..ServerSettings::default()
        })
    }

    /// Settings applied to every server this factory starts.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Directories awaiting cleanup.
    pub fn pending_cleanup(&self) -> Vec<PathBuf> {
        self.allocations()
            .iter()
            .flat_map(|allocation| allocation.dirs.iter().cloned())
            .collect()
    }

    fn allocations(&self) -> std::sync::MutexGuard<'_, Vec<Allocation>> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts an [`EmbeddedServer`] with concrete type, for callers that
    /// need its directories or address.
    pub fn start_server(&self, port: Port) -> Result<Arc<EmbeddedServer>, CreationError> {
        let data_dir = make_temp_dir("coord-data-")?;
        let snapshot_dir = match make_temp_dir("coord-snap-") {
            Ok(dir) => dir,
            Err(e) => {
                remove_dir_logged(&data_dir);
                return Err(e);
            }
        };

        let server = match EmbeddedServer::start(
            port,
            data_dir.clone(),
            snapshot_dir.clone(),
            self.settings.clone(),
        ) {
            Ok(server) => server,
            Err(e) => {
                remove_dir_logged(&data_dir);
                remove_dir_logged(&snapshot_dir);
                return Err(e);
            }
        };

        if port.is_auto() {
            tracing::debug!(
                "Server bound to port 0 actually started at port {}",
                server.port
            );
        } else {
            tracing::debug!("Server started at port {}", server.port);
        }

        if self.settings.cleanup_on_exit {
            self.allocations().push(Allocation {
                dirs: [data_dir, snapshot_dir],
                stopped: server.stopped.clone(),
            });
        }

        Ok(Arc::new(server))
    }
}

impl ServerFactory for EmbeddedServerFactory {
    fn create(&self, port: Port) -> Result<SharedHandle, CreationError> {
        let server: SharedHandle = self.start_server(port)?;
        Ok(server)
    }

    fn cleanup(&self) {
        self.allocations().retain(|allocation| {
            if !allocation.stopped.load(Ordering::SeqCst) {
                return true;
            }
            for dir in &allocation.dirs {
                remove_dir_logged(dir);
            }
            false
        });
    }
}

fn make_temp_dir(prefix: &str) -> Result<PathBuf, CreationError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map(|dir| dir.keep())
        .map_err(|source| CreationError::Storage { source })
}

fn remove_dir_logged(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                "Attempted to clean up {} but cleanup failed: {}",
                dir.display(),
                e
            );
        }
    }
}
