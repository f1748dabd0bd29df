//! Line-oriented TCP engine driver.
//!
//! Provides a [`TcpEngineDriver`] that opens plain TCP connections to
//! `<engine-prefix>tcp://<host>:<port>/<database>` URLs. Every statement
//! travels as one newline-terminated line answered by one reply line.
//!
//! ```text
//! TcpEngineDriver::connect(url, {user, password})
//!   → TCP connect
//!   → user non-empty → send "LOGIN <user> <password>"
//!     → "ERR ..." → connection closed, BrokerError::Engine
//!   → empty or no user → no login line (administrative connection)
//!
//! TcpConnection::execute("SELECT 1")
//!   → TCP write "SELECT 1\n"
//!   → TCP read one line
//!     → "ERR ..." → BrokerError::Engine
//!     → anything else → returned to the caller
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::config::BrokerConfig;
use crate::engine::{Connection, Driver, Properties, PropertyInfo};
use crate::error::{BrokerError, BrokerResult};

/// Reply prefix marking a failed statement.
pub const ERROR_REPLY_PREFIX: &str = "ERR";

/// First line sent by connections that carry a user.
pub const LOGIN_COMMAND: &str = "LOGIN";

/// How long [`TcpConnection::is_valid`] waits for the peer.
const LIVENESS_WAIT: Duration = Duration::from_millis(100);

// ── TcpConnection ────────────────────────────────────────────────────

/// A [`Connection`] exchanging statement and reply lines over TCP.
pub struct TcpConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    peer: String,
    closed: bool,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpConnection {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> BrokerResult<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            peer,
            closed: false,
        })
    }

    /// Send the login line for `user`; the server answers `ERR ...` when the
    /// credentials do not match.
    fn login(&mut self, user: &str, password: &str) -> BrokerResult<()> {
        self.execute(&format!("{LOGIN_COMMAND} {user} {password}"))
            .map(|_| ())
    }
}

/// Whether the peer of `stream` still holds the connection open.
///
/// Peeks one byte for at most `wait`. Pending data or an expired wait mean
/// alive; end of stream or any other error mean gone. The previous read
/// timeout is put back afterwards.
fn peer_alive(stream: &TcpStream, wait: Duration) -> bool {
    let previous = stream.read_timeout().ok().flatten();
    if stream.set_read_timeout(Some(wait)).is_err() {
        return false;
    }

    let mut byte = [0u8; 1];
    let alive = match stream.peek(&mut byte) {
        Ok(n) => n > 0,
        Err(e) => matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
    };

    if let Err(e) = stream.set_read_timeout(previous) {
        debug!(error = %e, "could not restore read timeout");
    }
    alive
}

impl Connection for TcpConnection {
    fn execute(&mut self, statement: &str) -> BrokerResult<String> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if statement.contains(['\n', '\r']) {
            return Err(BrokerError::Engine(
                "statement must fit on a single line".to_string(),
            ));
        }

        self.stream
            .write_all(format!("{statement}\n").as_bytes())
            .map_err(|e| BrokerError::Engine(format!("tcp send to {}: {e}", self.peer)))?;

        let mut reply = String::new();
        let n = self
            .reader
            .read_line(&mut reply)
            .map_err(|e| BrokerError::Engine(format!("tcp recv from {}: {e}", self.peer)))?;
        if n == 0 {
            return Err(BrokerError::Engine(format!(
                "connection closed by {}",
                self.peer
            )));
        }

        let reply = reply.trim_end_matches(['\n', '\r']).to_string();
        if reply.starts_with(ERROR_REPLY_PREFIX) {
            return Err(BrokerError::Engine(reply));
        }
        Ok(reply)
    }

    fn is_valid(&mut self) -> bool {
        !self.closed && peer_alive(&self.stream, LIVENESS_WAIT)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> BrokerResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // The peer went away first.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(BrokerError::Engine(format!("tcp shutdown: {e}"))),
        }
    }
}

// ── TcpEngineDriver ──────────────────────────────────────────────────

/// Driver for `<engine-prefix>tcp://<host>:<port>/...` URLs.
#[derive(Clone, Debug)]
pub struct TcpEngineDriver {
    /// Scheme prefix in front of `tcp://`, e.g. `h2:`.
    prefix: String,
    /// Timeout for establishing TCP connections.
    connect_timeout: Duration,
    /// Timeout for reading a reply line.
    read_timeout: Duration,
}

impl TcpEngineDriver {
    pub fn new(prefix: &str, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            prefix: prefix.to_string(),
            connect_timeout,
            read_timeout,
        }
    }

    /// Driver for the engine prefix and timeouts of `config`.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            &config.url.engine_prefix,
            Duration::from_millis(config.engine.connect_timeout_ms),
            Duration::from_millis(config.engine.read_timeout_ms),
        )
    }

    /// `host:port` addressed by `url`, or `None` if the URL is not ours.
    fn address<'a>(&self, url: &'a str) -> Option<&'a str> {
        let rest = url.strip_prefix(self.prefix.as_str())?.strip_prefix("tcp://")?;
        let address = rest.split(['/', ';']).next().unwrap_or(rest);
        (!address.is_empty()).then_some(address)
    }
}

impl Driver for TcpEngineDriver {
    fn connect(&self, url: &str, props: &Properties) -> BrokerResult<Option<Box<dyn Connection>>> {
        let Some(address) = self.address(url) else {
            return Ok(None);
        };

        let addrs = address
            .to_socket_addrs()
            .map_err(|e| BrokerError::Engine(format!("dns resolution failed for {address}: {e}")))?;

        // `localhost` may resolve to both families; take the first that answers.
        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let stream = match (connected, last_error) {
            (Some(stream), _) => stream,
            (None, Some(e)) => {
                return Err(BrokerError::Engine(format!("tcp connect to {address}: {e}")));
            }
            (None, None) => {
                return Err(BrokerError::Engine(format!("no address found for {address}")));
            }
        };
        stream
            .set_read_timeout(Some(self.read_timeout))
            .map_err(|e| BrokerError::Engine(format!("set read timeout: {e}")))?;
        let _ = stream.set_nodelay(true);

        let mut connection = TcpConnection::new(stream)?;
        if let Some(user) = props.user().filter(|u| !u.is_empty()) {
            if let Err(e) = connection.login(user, props.password().unwrap_or_default()) {
                if let Err(close_err) = connection.close() {
                    debug!(address = %address, error = %close_err, "close after failed login");
                }
                return Err(e);
            }
        }

        debug!(address = %address, user = ?props.user(), "established engine connection");
        Ok(Some(Box::new(connection)))
    }

    fn accepts_url(&self, url: &str) -> bool {
        self.address(url).is_some()
    }

    fn property_info(&self, _url: &str, props: &Properties) -> Vec<PropertyInfo> {
        ["user", "password"]
            .into_iter()
            .map(|name| PropertyInfo {
                name: name.to_string(),
                value: props.get(name).map(str::to_string),
                description: format!("{name} sent in the {LOGIN_COMMAND} line"),
                required: false,
            })
            .collect()
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn is_compliant(&self) -> bool {
        false
    }
}

// ── Tests ────────────────────────────────────────────────────────────
