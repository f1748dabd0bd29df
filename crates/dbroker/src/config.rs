//! Broker configuration.
//!
//! Parsed from TOML. Every field has a default, so an empty file parses.
//! `[server] program` defaults to empty and must name a server that speaks the
//! line protocol of [`TcpEngineDriver`](crate::TcpEngineDriver) before the
//! broker can start servers:
//!
//! ```toml
//! base_dir = "/var/lib/dbroker"
//!
//! [url]
//! broker_prefix = "broker+h2:"
//! engine_prefix = "h2:"
//!
//! [server]
//! program = "/usr/local/bin/line-db-server"
//! args = ["--port", "{port}", "--dir", "{dir}"]
//! ready_timeout_ms = 10000
//! poll_interval_ms = 50
//!
//! [engine]
//! connect_timeout_ms = 5000
//! read_timeout_ms = 30000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};
use crate::url::UrlDialect;

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Directory under which every server gets a `tcp-<port>` storage directory.
    pub base_dir: PathBuf,
    pub url: UrlDialect,
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

/// How server processes are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable; empty until configured.
    pub program: String,
    /// Argument templates; `{port}` and `{dir}` are substituted at launch.
    pub args: Vec<String>,
    pub ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Settings for the TCP engine driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("dbroker"),
            url: UrlDialect::default(),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: ["--port", "{port}", "--dir", "{dir}"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            ready_timeout_ms: 10_000,
            poll_interval_ms: 50,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &Path) -> BrokerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> BrokerResult<Self> {
        toml::from_str(content).map_err(|e| BrokerError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> BrokerResult<String> {
        toml::to_string_pretty(self).map_err(|e| BrokerError::Config(e.to_string()))
    }

    /// Builder method: set the base storage directory.
    pub fn with_base_dir(self, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..self
        }
    }

    /// Builder method: set the URL dialect.
    pub fn with_dialect(self, url: UrlDialect) -> Self {
        Self { url, ..self }
    }
}
