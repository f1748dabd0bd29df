//! In-memory collaborators shared by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::{Connection, Driver, Properties, PropertyInfo};
use crate::error::{BrokerError, BrokerResult};
use crate::server::{ServerLauncher, ServerProcess};

// ── Launcher ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockProcess {
    port: u16,
    launcher: Arc<LauncherLog>,
}

impl ServerProcess for MockProcess {
    fn terminate(&mut self) -> BrokerResult<()> {
        self.launcher.terminations.fetch_add(1, Ordering::SeqCst);
        self.launcher.running.lock().unwrap().retain(|p| *p != self.port);
        if self.launcher.fail_terminate.load(Ordering::SeqCst) {
            return Err(BrokerError::Terminate("process did not exit".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LauncherLog {
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    pub fail_launch: AtomicBool,
    pub fail_terminate: AtomicBool,
    pub launched: Mutex<Vec<(u16, PathBuf)>>,
    pub running: Mutex<Vec<u16>>,
}

#[derive(Clone, Debug, Default)]
pub struct MockLauncher {
    pub log: Arc<LauncherLog>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> usize {
        self.log.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.log.terminations.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, port: u16) -> bool {
        self.log.running.lock().unwrap().contains(&port)
    }
}

impl ServerLauncher for MockLauncher {
    fn launch(&self, port: u16, storage_dir: &Path) -> BrokerResult<Box<dyn ServerProcess>> {
        if self.log.fail_launch.load(Ordering::SeqCst) {
            return Err(BrokerError::PortInUse(port));
        }
        self.log.launches.fetch_add(1, Ordering::SeqCst);
        self.log
            .launched
            .lock()
            .unwrap()
            .push((port, storage_dir.to_path_buf()));
        self.log.running.lock().unwrap().push(port);
        Ok(Box::new(MockProcess {
            port,
            launcher: Arc::clone(&self.log),
        }))
    }
}

// ── Engine ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct EngineLog {
    /// `(url, statement)` in execution order.
    pub statements: Mutex<Vec<(String, String)>>,
    /// `(url, user)` for every opened connection.
    pub connects: Mutex<Vec<(String, Option<String>)>>,
    pub closes: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_statements: AtomicBool,
    pub fail_close: AtomicBool,
    pub reject: AtomicBool,
}

#[derive(Debug)]
pub struct MockConnection {
    url: String,
    closed: bool,
    log: Arc<EngineLog>,
}

impl Connection for MockConnection {
    fn execute(&mut self, statement: &str) -> BrokerResult<String> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.log.fail_statements.load(Ordering::SeqCst) {
            return Err(BrokerError::Engine(format!("syntax error in '{statement}'")));
        }
        self.log
            .statements
            .lock()
            .unwrap()
            .push((self.url.clone(), statement.to_string()));
        Ok("OK".to_string())
    }

    fn is_valid(&mut self) -> bool {
        !self.closed
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> BrokerResult<()> {
        self.closed = true;
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        if self.log.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Engine("close failed".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockEngine {
    pub log: Arc<EngineLog>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> Vec<(String, String)> {
        self.log.statements.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<(String, Option<String>)> {
        self.log.connects.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.log.closes.load(Ordering::SeqCst)
    }
}

impl Driver for MockEngine {
    fn connect(&self, url: &str, props: &Properties) -> BrokerResult<Option<Box<dyn Connection>>> {
        if !self.accepts_url(url) || self.log.reject.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if self.log.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Engine("connection refused".to_string()));
        }
        self.log
            .connects
            .lock()
            .unwrap()
            .push((url.to_string(), props.user().map(str::to_string)));
        Ok(Some(Box::new(MockConnection {
            url: url.to_string(),
            closed: false,
            log: Arc::clone(&self.log),
        })))
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with("h2:")
    }

    fn property_info(&self, _url: &str, props: &Properties) -> Vec<PropertyInfo> {
        vec![PropertyInfo {
            name: "user".to_string(),
            value: props.user().map(str::to_string),
            description: "login name".to_string(),
            required: false,
        }]
    }

    fn major_version(&self) -> u32 {
        2
    }

    fn minor_version(&self) -> u32 {
        3
    }

    fn is_compliant(&self) -> bool {
        true
    }
}
