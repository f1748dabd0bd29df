//! Connection wrapper that gives a port back to the registry on close.
//!
//! [`TrackedConnection`] delegates every [`Connection`] operation to the
//! engine connection. `close()` forwards first and then releases the port,
//! whatever the forwarded close returned, so the server is never stopped
//! under a close that is still running and the slot is never leaked by a
//! failing close. The release happens at most once per connection; dropping
//! an unclosed connection closes it.
//!
//! A lease names the server generation it was acquired from, so a connection
//! that outlives a registry shutdown cannot release a server started later on
//! the same port.

use std::sync::Arc;

use tracing::warn;

use crate::engine::Connection;
use crate::error::BrokerResult;
use crate::registry::ServerRegistry;

/// The registry slot held by an open connection.
#[derive(Debug)]
struct PortLease {
    port: u16,
    generation: u64,
    registry: Arc<ServerRegistry>,
}

/// An engine connection counted against a port of a [`ServerRegistry`].
#[derive(Debug)]
pub struct TrackedConnection {
    inner: Box<dyn Connection>,
    port: u16,
    /// `None` once the port has been released.
    lease: Option<PortLease>,
}

impl TrackedConnection {
    /// Wrap `inner`, which must already be counted against `port` in `registry`
    /// under `generation`, as reported by [`ServerRegistry::acquire`].
    pub fn new(
        inner: Box<dyn Connection>,
        port: u16,
        generation: u64,
        registry: Arc<ServerRegistry>,
    ) -> Self {
        Self {
            inner,
            port,
            lease: Some(PortLease {
                port,
                generation,
                registry,
            }),
        }
    }

    /// Port this connection is counted against.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the port has not been released yet.
    pub fn holds_port(&self) -> bool {
        self.lease.is_some()
    }

    fn release(&mut self) -> BrokerResult<()> {
        match self.lease.take() {
            Some(lease) => lease.registry.release(lease.port, lease.generation),
            None => Ok(()),
        }
    }
}

impl Connection for TrackedConnection {
    fn execute(&mut self, statement: &str) -> BrokerResult<String> {
        self.inner.execute(statement)
    }

    fn is_valid(&mut self) -> bool {
        self.inner.is_valid()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the engine connection, then release the port.
    ///
    /// A failed engine close takes precedence in the returned error; a release
    /// failure is returned only when the engine close succeeded.
    fn close(&mut self) -> BrokerResult<()> {
        let closed = self.inner.close();
        let released = self.release();

        if let (Err(close_err), Err(release_err)) = (&closed, &released) {
            warn!(
                port = self.port,
                close_error = %close_err,
                release_error = %release_err,
                "close and release both failed"
            );
        }
        closed.and(released)
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        if self.lease.is_none() {
            return;
        }
        if !self.inner.is_closed() {
            if let Err(e) = self.inner.close() {
                warn!(port = self.port, error = %e, "failed to close dropped connection");
            }
        }
        if let Err(e) = self.release() {
            warn!(port = self.port, error = %e, "failed to release dropped connection");
        }
    }
}
