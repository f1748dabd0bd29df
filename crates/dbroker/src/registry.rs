//! Server registry: port → server map with per-port connection counting.
//!
//! # Lifecycle
//!
//! ```text
//! acquire(port)
//!   → no server for port → create handle, queue credentials, start it
//!       → start fails → error, nothing registered (next acquire retries)
//!   → server running     → provision credentials right away
//!   → connections += 1
//!
//! release(port, generation)
//!   → unknown port       → no-op
//!   → other generation   → no-op (lease predates a restart of the port)
//!   → connections -= 1
//!   → reached zero       → unregister and stop the server
//! ```
//!
//! # Concurrency
//!
//! One `std::sync::Mutex` guards every port. It is held across server start
//! and stop, so two callers can never race to create two servers for the same
//! port, and the acquire/release sequence of each port is totally ordered.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::engine::{Driver, Properties};
use crate::error::BrokerResult;
use crate::server::{ServerHandle, ServerLauncher};
use crate::url::UrlDialect;

/// Login to provision on the target database of an acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: Option<&'a str>,
}

impl<'a> Credentials<'a> {
    /// Credentials from the `user`/`password` properties; `None` without a user.
    pub fn from_properties(props: &'a Properties) -> Option<Self> {
        props.user().map(|user| Self {
            user,
            password: props.password(),
        })
    }
}

/// Snapshot of a registered server, returned by [`ServerRegistry::acquire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub port: u16,
    pub storage_dir: PathBuf,
    /// Identifies this start of the server; pass it back to
    /// [`ServerRegistry::release`].
    pub generation: u64,
    /// Open connections counted against the port, including the new one.
    pub connections: usize,
}

/// A running server and the number of connections holding it.
#[derive(Debug)]
struct RegisteredServer {
    handle: ServerHandle,
    generation: u64,
    connections: usize,
}

/// Starts a server on the first connection to a port and stops it after the
/// last one closes.
///
/// Only running servers are registered: a port is present exactly when its
/// server is running and at least one connection holds it.
pub struct ServerRegistry {
    base_dir: PathBuf,
    launcher: Arc<dyn ServerLauncher>,
    engine: Arc<dyn Driver>,
    dialect: UrlDialect,
    servers: Mutex<HashMap<u16, RegisteredServer>>,
    next_generation: AtomicU64,
}

impl ServerRegistry {
    pub fn new(
        base_dir: &Path,
        launcher: Arc<dyn ServerLauncher>,
        engine: Arc<dyn Driver>,
        dialect: UrlDialect,
    ) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            launcher,
            engine,
            dialect,
            servers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Count one more connection against `port`, starting its server first if
    /// none is running.
    ///
    /// `credentials` are provisioned on `database`: queued and applied by the
    /// start when the server is new, applied directly when it already runs.
    pub fn acquire(
        &self,
        port: u16,
        credentials: Option<Credentials<'_>>,
        database: &str,
    ) -> BrokerResult<ServerInfo> {
        let mut servers = self.lock();

        let server = match servers.entry(port) {
            Entry::Occupied(entry) => {
                let server = entry.into_mut();
                if let Some(c) = credentials {
                    server.handle.add_user(c.user, c.password, database)?;
                }
                server
            }
            Entry::Vacant(entry) => {
                let mut handle = ServerHandle::new(
                    &self.base_dir,
                    port,
                    Arc::clone(&self.launcher),
                    Arc::clone(&self.engine),
                    self.dialect.clone(),
                );
                if let Some(c) = credentials {
                    handle.add_user(c.user, c.password, database)?;
                }
                // A failed start drops the handle here, leaving nothing registered.
                handle.start()?;
                entry.insert(RegisteredServer {
                    handle,
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    connections: 0,
                })
            }
        };

        server.connections += 1;
        debug!(
            port,
            database = %database,
            generation = server.generation,
            connections = server.connections,
            "acquired server"
        );

        Ok(ServerInfo {
            port,
            storage_dir: server.handle.storage_dir().to_path_buf(),
            generation: server.generation,
            connections: server.connections,
        })
    }

    /// Count one connection less against `port`, stopping its server when it
    /// was the last.
    ///
    /// `generation` is the one [`acquire`](Self::acquire) reported. Unknown
    /// ports are ignored, and so are generations other than the running
    /// server's: those come from connections that outlived a shutdown.
    /// When the stop fails the port is unregistered anyway and the failure is
    /// returned.
    pub fn release(&self, port: u16, generation: u64) -> BrokerResult<()> {
        let mut servers = self.lock();

        let remaining = match servers.get_mut(&port) {
            Some(server) if server.generation != generation => {
                debug!(
                    port,
                    generation,
                    current = server.generation,
                    "release for an earlier server generation ignored"
                );
                return Ok(());
            }
            Some(server) => {
                server.connections = server.connections.saturating_sub(1);
                server.connections
            }
            None => {
                debug!(port, "release for unmanaged port ignored");
                return Ok(());
            }
        };
        debug!(port, connections = remaining, "released server");
        if remaining > 0 {
            return Ok(());
        }

        if let Some(mut server) = servers.remove(&port) {
            info!(port, "last connection closed, stopping server");
            server.handle.stop().inspect_err(|e| {
                warn!(port, error = %e, "server did not stop cleanly, unregistered anyway");
            })?;
        }
        Ok(())
    }

    /// Stop every registered server and forget them.
    ///
    /// Returns the number of servers that were stopped. Stop failures are
    /// logged and do not interrupt the teardown.
    pub fn shutdown(&self) -> usize {
        let mut servers = self.lock();
        let count = servers.len();

        for (port, mut server) in servers.drain() {
            if let Err(e) = server.handle.stop() {
                warn!(port, error = %e, "failed to stop server during shutdown");
            }
            debug!(port, connections = server.connections, "stopped server during shutdown");
        }

        info!(stopped = count, "server registry shut down");
        count
    }

    /// Open connections counted against `port`, or `None` if no server runs on it.
    pub fn connection_count(&self, port: u16) -> Option<usize> {
        self.lock().get(&port).map(|s| s.connections)
    }

    pub fn is_running(&self, port: u16) -> bool {
        self.lock().contains_key(&port)
    }

    /// Ports with a running server, ascending.
    pub fn running_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Log per-port statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let servers = self.lock();
        for (port, server) in servers.iter() {
            info!(
                port = *port,
                connections = server.connections,
                storage_dir = ?server.handle.storage_dir(),
                "server statistics"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, RegisteredServer>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("base_dir", &self.base_dir)
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}
