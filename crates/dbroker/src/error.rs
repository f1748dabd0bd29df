//! Error types for the connection broker.

use thiserror::Error;

use crate::server::ServerState;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur while opening, closing, or managing connections.
///
/// The first group of variants names the phase of an `open`/`close` that
/// failed and wraps the underlying cause; the second group is raised by the
/// collaborators themselves (launcher, engine, router).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("malformed url '{url}': {reason}")]
    Format { url: String, reason: String },

    #[error("unable to start the server on port {port}: {source}")]
    Startup {
        port: u16,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("unable to provision user '{user}' on database '{database}' (port {port}): {source}")]
    Provisioning {
        user: String,
        database: String,
        port: u16,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("unable to stop the server on port {port}: {source}")]
    Shutdown {
        port: u16,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("unable to connect to '{url}': {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("port {0} is already bound")]
    PortInUse(u16),

    #[error("failed to launch server: {0}")]
    Launch(String),

    #[error("failed to terminate server: {0}")]
    Terminate(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("engine driver does not accept url '{0}'")]
    EngineRejected(String),

    #[error("cannot {operation} server on port {port} in state {state}")]
    InvalidState {
        port: u16,
        state: ServerState,
        operation: &'static str,
    },

    #[error("invalid user name '{0}'")]
    InvalidUserName(String),

    #[error("connection is closed")]
    Closed,

    #[error("no suitable driver for url '{0}'")]
    NoSuitableDriver(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Wrap `self` as the cause of a failed connect.
    pub(crate) fn into_connect(self, url: &str) -> Self {
        BrokerError::Connect {
            url: url.to_string(),
            source: Box::new(self),
        }
    }
}
