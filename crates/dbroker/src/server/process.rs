//! Launcher for server processes run as child commands.
//!
//! The command line is a program plus argument templates. `{port}` and `{dir}`
//! in any argument are replaced by the listening port and the storage
//! directory:
//!
//! ```text
//! line-db-server --port {port} --dir {dir}
//! ```
//!
//! The program must serve the line protocol of
//! [`TcpEngineDriver`](crate::TcpEngineDriver); there is no default, and a
//! launcher without one fails every launch with [`BrokerError::Config`].
//!
//! A launch refuses ports that are already bound, then polls the port until the
//! child accepts TCP connections. A child that exits early or is not ready in
//! time is killed and reported as [`BrokerError::Launch`].

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{ServerLauncher, ServerProcess};
use crate::config::ServerConfig;
use crate::error::{BrokerError, BrokerResult};

/// Placeholder replaced by the listening port.
pub const PORT_PLACEHOLDER: &str = "{port}";
/// Placeholder replaced by the storage directory.
pub const DIR_PLACEHOLDER: &str = "{dir}";

/// A [`ServerLauncher`] that spawns a child process per server.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    /// How long to wait for the child to accept connections.
    ready_timeout: Duration,
    /// Delay between readiness checks.
    poll_interval: Duration,
}

impl CommandLauncher {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            ready_timeout: Duration::from_millis(config.ready_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Builder method: set the readiness timeout.
    pub fn with_ready_timeout(self, ready_timeout: Duration) -> Self {
        Self {
            ready_timeout,
            ..self
        }
    }

    /// Builder method: set the readiness poll interval.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// Arguments with placeholders substituted.
    pub fn render_args(&self, port: u16, storage_dir: &Path) -> Vec<String> {
        let port = port.to_string();
        let dir = storage_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port).replace(DIR_PLACEHOLDER, &dir))
            .collect()
    }

    fn wait_until_ready(&self, child: &mut Child, port: u16) -> BrokerResult<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let deadline = Instant::now() + self.ready_timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BrokerError::Launch(format!(
                    "'{}' exited with {status} before accepting connections on port {port}",
                    self.program
                )));
            }
            if TcpStream::connect_timeout(&addr, self.poll_interval).is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrokerError::Launch(format!(
                    "'{}' not accepting connections on port {port} after {:?}",
                    self.program, self.ready_timeout
                )));
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl ServerLauncher for CommandLauncher {
    fn launch(&self, port: u16, storage_dir: &Path) -> BrokerResult<Box<dyn ServerProcess>> {
        if self.program.is_empty() {
            return Err(BrokerError::Config(
                "no server program configured; set `program` in the [server] section".to_string(),
            ));
        }
        ensure_port_free(port)?;
        std::fs::create_dir_all(storage_dir)?;

        let args = self.render_args(port, storage_dir);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BrokerError::Launch(format!("spawn '{}': {e}", self.program)))?;
        debug!(pid = child.id(), port, program = %self.program, ?args, "spawned server process");

        if let Err(e) = self.wait_until_ready(&mut child, port) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        Ok(Box::new(ChildProcess {
            child,
            port,
            terminated: false,
        }))
    }
}

/// Fails with [`BrokerError::PortInUse`] if something already listens on `port`.
fn ensure_port_free(port: u16) -> BrokerResult<()> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(_listener) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(BrokerError::PortInUse(port)),
        Err(e) => Err(BrokerError::Launch(format!("cannot bind port {port}: {e}"))),
    }
}

/// A server running as a child process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    port: u16,
    terminated: bool,
}

impl ChildProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl ServerProcess for ChildProcess {
    fn terminate(&mut self) -> BrokerResult<()> {
        self.terminated = true;
        self.child
            .kill()
            .map_err(|e| BrokerError::Terminate(format!("kill pid {}: {e}", self.child.id())))?;
        let status = self
            .child
            .wait()
            .map_err(|e| BrokerError::Terminate(format!("wait pid {}: {e}", self.child.id())))?;
        debug!(port = self.port, %status, "server process exited");
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.terminated {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
