//! dbroker: connection broker that runs a database server per port on demand.
//!
//! Opening a broker URL such as `broker+h2:tcp://localhost:1503/mydatabase`
//! starts a database server on port 1503 if none runs there, provisions the
//! requested login, and hands back a connection. Closing the last connection
//! to a port stops its server.
//!
//! - **url**: Broker URL dialect and the rewrite to engine URLs
//! - **server**: Server handle, deferred user provisioning, process launcher
//! - **registry**: Port → server map with per-port connection counting
//! - **connection**: Connection wrapper that releases its port on close
//! - **broker**: The [`Broker`] driver tying the above together
//! - **router**: [`DriverRouter`] chaining the broker in front of other drivers
//! - **tcp**: Line-oriented TCP engine driver
//! - **config**: [`BrokerConfig`] parsing from TOML

pub mod broker;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod registry;
pub mod router;
pub mod server;
pub mod tcp;
pub mod url;

#[cfg(test)]
mod test_support;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use connection::TrackedConnection;
pub use engine::{Connection, Driver, Properties, PropertyInfo};
pub use error::{BrokerError, BrokerResult};
pub use registry::ServerRegistry;
pub use router::DriverRouter;
pub use server::process::CommandLauncher;
pub use server::{ServerLauncher, ServerProcess};
pub use tcp::TcpEngineDriver;
pub use url::UrlDialect;
