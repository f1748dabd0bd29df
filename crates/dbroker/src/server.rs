//! Server handle: one backend database server bound to one port.
//!
//! A [`ServerHandle`] is created `NotStarted`. Users added before the server
//! runs are queued as [`PendingUser`]s and provisioned, in order, as soon as
//! [`ServerHandle::start`] has launched the process. Users added while the
//! server runs are provisioned immediately.
//!
//! ```text
//! NotStarted ──start()──▶ Running ──stop()──▶ Stopped
//!     │                      ▲
//!     └─ add_user(): queue   └─ add_user(): DROP USER / CREATE USER
//! ```
//!
//! The process itself comes from a [`ServerLauncher`]; see [`process`] for
//! the launcher that spawns a real server binary.

pub mod process;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::{Driver, Properties};
use crate::error::{BrokerError, BrokerResult};
use crate::url::UrlDialect;

/// Launches backend server processes.
pub trait ServerLauncher: Send + Sync {
    /// Launch a server listening on `port` with its data under `storage_dir`.
    /// Blocks until the server accepts connections or fails to start.
    fn launch(&self, port: u16, storage_dir: &Path) -> BrokerResult<Box<dyn ServerProcess>>;
}

/// A running backend server process.
pub trait ServerProcess: Send + fmt::Debug {
    /// Terminate the process. Called at most once.
    fn terminate(&mut self) -> BrokerResult<()>;
}

/// A login waiting for its server to start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingUser {
    pub username: String,
    pub password: String,
    pub database: String,
}

impl PendingUser {
    /// A missing password is stored as the empty string.
    pub fn new(username: &str, password: Option<&str>, database: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.unwrap_or_default().to_string(),
            database: database.to_string(),
        }
    }
}

/// Lifecycle state of a [`ServerHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerState {
    NotStarted,
    Running,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::NotStarted => write!(f, "not started"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// In-process representative of one backend server.
pub struct ServerHandle {
    port: u16,
    storage_dir: PathBuf,
    state: ServerState,
    process: Option<Box<dyn ServerProcess>>,
    /// Users to provision on start, in enqueue order.
    pending_users: Vec<PendingUser>,
    launcher: Arc<dyn ServerLauncher>,
    /// Used for the administrative connections that provision users.
    engine: Arc<dyn Driver>,
    dialect: UrlDialect,
}

impl ServerHandle {
    /// Create a handle for `port` storing its data in `<base_dir>/tcp-<port>`.
    pub fn new(
        base_dir: &Path,
        port: u16,
        launcher: Arc<dyn ServerLauncher>,
        engine: Arc<dyn Driver>,
        dialect: UrlDialect,
    ) -> Self {
        Self {
            port,
            storage_dir: storage_dir_for(base_dir, port),
            state: ServerState::NotStarted,
            process: None,
            pending_users: Vec::new(),
            launcher,
            engine,
            dialect,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn pending_users(&self) -> &[PendingUser] {
        &self.pending_users
    }

    /// Launch the server and provision every pending user.
    ///
    /// A launch failure is returned as [`BrokerError::Startup`] and leaves the
    /// handle `NotStarted`. A provisioning failure terminates the freshly
    /// launched process, leaves the handle `Stopped` and is returned as
    /// [`BrokerError::Provisioning`].
    pub fn start(&mut self) -> BrokerResult<()> {
        if self.state != ServerState::NotStarted {
            return Err(self.invalid_state("start"));
        }

        info!(port = self.port, storage_dir = ?self.storage_dir, "starting database server");
        let process = self
            .launcher
            .launch(self.port, &self.storage_dir)
            .map_err(|source| BrokerError::Startup {
                port: self.port,
                source: Box::new(source),
            })?;
        self.process = Some(process);
        self.state = ServerState::Running;

        let pending = std::mem::take(&mut self.pending_users);
        for user in &pending {
            if let Err(e) = self.insert_user(user) {
                warn!(
                    port = self.port,
                    user = %user.username,
                    error = %e,
                    "provisioning failed during start, stopping server"
                );
                if let Err(stop_err) = self.stop() {
                    warn!(port = self.port, error = %stop_err, "failed to stop server after provisioning failure");
                }
                return Err(e);
            }
        }

        info!(port = self.port, provisioned = pending.len(), "database server started");
        Ok(())
    }

    /// Add a login for `database`.
    ///
    /// Provisioned right away on a running server, queued on a server that
    /// has not started yet. Provisioning the same user twice is harmless: the
    /// user is dropped and recreated.
    pub fn add_user(&mut self, username: &str, password: Option<&str>, database: &str) -> BrokerResult<()> {
        let user = PendingUser::new(username, password, database);
        match self.state {
            ServerState::Running => self.insert_user(&user),
            ServerState::NotStarted => {
                debug!(port = self.port, user = %user.username, database = %user.database, "queued user until server start");
                self.pending_users.push(user);
                Ok(())
            }
            ServerState::Stopped => Err(self.invalid_state("add user to")),
        }
    }

    /// Terminate the server process.
    ///
    /// Only valid on a running server. The handle is `Stopped` afterwards even
    /// when termination fails; the failure is returned as
    /// [`BrokerError::Shutdown`].
    pub fn stop(&mut self) -> BrokerResult<()> {
        let Some(mut process) = self.process.take() else {
            return Err(self.invalid_state("stop"));
        };
        self.state = ServerState::Stopped;

        process.terminate().map_err(|source| BrokerError::Shutdown {
            port: self.port,
            source: Box::new(source),
        })?;
        info!(port = self.port, "database server stopped");
        Ok(())
    }

    /// Drop and recreate `user` through a throwaway admin connection.
    fn insert_user(&self, user: &PendingUser) -> BrokerResult<()> {
        let provisioning = |source: BrokerError| BrokerError::Provisioning {
            user: user.username.clone(),
            database: user.database.clone(),
            port: self.port,
            source: Box::new(source),
        };

        validate_user_name(&user.username).map_err(provisioning)?;

        let url = self.dialect.engine_tcp_url(self.port, &user.database);
        let admin = Properties::with_credentials("", Some(""));
        let mut connection = self
            .engine
            .connect(&url, &admin)
            .and_then(|c| c.ok_or_else(|| BrokerError::EngineRejected(url.clone())))
            .map_err(provisioning)?;

        let executed = provisioning_statements(user)
            .iter()
            .try_for_each(|statement| connection.execute(statement).map(drop));
        let closed = connection.close();
        executed.and(closed).map_err(provisioning)?;

        debug!(port = self.port, user = %user.username, database = %user.database, "provisioned user");
        Ok(())
    }

    fn invalid_state(&self, operation: &'static str) -> BrokerError {
        BrokerError::InvalidState {
            port: self.port,
            state: self.state,
            operation,
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("state", &self.state)
            .field("pending_users", &self.pending_users.len())
            .finish_non_exhaustive()
    }
}

/// Per-port storage directory under `base_dir`.
pub fn storage_dir_for(base_dir: &Path, port: u16) -> PathBuf {
    base_dir.join(format!("tcp-{port}"))
}

/// User names are spliced into statements, so only plain identifiers pass.
fn validate_user_name(name: &str) -> BrokerResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidUserName(name.to_string()))
    }
}

fn provisioning_statements(user: &PendingUser) -> [String; 2] {
    [
        format!("DROP USER IF EXISTS {}", user.username),
        format!(
            "CREATE USER {} PASSWORD '{}' ADMIN",
            user.username,
            user.password.replace('\'', "''")
        ),
    ]
}
