//! Connection URL dialect.
//!
//! The broker owns every URL that starts with its scheme prefix. Such a URL is
//! rewritten for the engine by swapping the broker prefix for the engine's
//! own prefix:
//!
//! ```text
//! broker+h2:tcp://localhost:1503/mydatabase;TRACE_LEVEL_FILE=0
//!   → h2:tcp://localhost:1503/mydatabase;TRACE_LEVEL_FILE=0   (port 1503, database "mydatabase")
//! broker+h2:mem:scratch
//!   → h2:mem:scratch                                           (no port, passed straight through)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Marker of the networked form, directly after the broker prefix.
pub const TCP_LOCALHOST: &str = "tcp://localhost:";

/// Scheme prefixes of the broker dialect and of the engine it fronts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlDialect {
    /// Prefix identifying URLs handled by the broker (default: `broker+h2:`).
    pub broker_prefix: String,
    /// Prefix substituted for the broker prefix when talking to the engine
    /// (default: `h2:`).
    pub engine_prefix: String,
}

impl Default for UrlDialect {
    fn default() -> Self {
        Self {
            broker_prefix: "broker+h2:".to_string(),
            engine_prefix: "h2:".to_string(),
        }
    }
}

/// Port and database addressed by a networked URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TcpTarget {
    pub port: u16,
    pub database: String,
}

/// Result of rewriting a broker URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RewrittenUrl {
    /// URL to hand to the engine driver.
    pub engine_url: String,
    /// Set for the networked form only.
    pub target: Option<TcpTarget>,
}

impl UrlDialect {
    pub fn new(broker_prefix: &str, engine_prefix: &str) -> Self {
        Self {
            broker_prefix: broker_prefix.to_string(),
            engine_prefix: engine_prefix.to_string(),
        }
    }

    /// Whether `url` belongs to the broker dialect.
    pub fn accepts(&self, url: &str) -> bool {
        url.starts_with(&self.broker_prefix)
    }

    /// Rewrite a broker URL for the engine.
    ///
    /// Returns `Ok(None)` for URLs outside the dialect. A networked URL with a
    /// missing or unparsable port is a [`BrokerError::Format`].
    pub fn rewrite(&self, url: &str) -> BrokerResult<Option<RewrittenUrl>> {
        let Some(rest) = url.strip_prefix(self.broker_prefix.as_str()) else {
            return Ok(None);
        };

        let target = match rest.strip_prefix(TCP_LOCALHOST) {
            Some(address) => Some(parse_tcp_target(url, address)?),
            None => None,
        };

        Ok(Some(RewrittenUrl {
            engine_url: format!("{}{rest}", self.engine_prefix),
            target,
        }))
    }

    /// Broker URL addressing `database` on the server listening on `port`.
    pub fn tcp_url(&self, port: u16, database: &str) -> String {
        format!("{}{TCP_LOCALHOST}{port}/{database}", self.broker_prefix)
    }

    /// Engine URL addressing `database` on the server listening on `port`.
    pub fn engine_tcp_url(&self, port: u16, database: &str) -> String {
        format!("{}{TCP_LOCALHOST}{port}/{database}", self.engine_prefix)
    }
}

/// Parse `<port>/<database>[;options]`.
fn parse_tcp_target(url: &str, address: &str) -> BrokerResult<TcpTarget> {
    let format_error = |reason: String| BrokerError::Format {
        url: url.to_string(),
        reason,
    };

    let (port, path) = address
        .split_once('/')
        .ok_or_else(|| format_error("expected '/' after the port number".to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|e| format_error(format!("invalid port '{port}': {e}")))?;
    if port == 0 {
        return Err(format_error("port must be greater than zero".to_string()));
    }

    let database = match path.split_once(';') {
        Some((database, _options)) => database,
        None => path,
    };

    Ok(TcpTarget {
        port,
        database: database.to_string(),
    })
}
