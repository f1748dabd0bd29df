//! Driver router: chained driver discovery.
//!
//! Callers open connections through a [`DriverRouter`] without knowing which
//! driver handles a URL. Each registered driver is asked in registration
//! order; a driver answers `Ok(None)` for URLs it does not own and the router
//! moves on. The broker registers itself here on start and deregisters on
//! stop.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::engine::{Connection, Driver, Properties};
use crate::error::{BrokerError, BrokerResult};

/// Ordered set of drivers consulted for every connection request.
#[derive(Default)]
pub struct DriverRouter {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
}

impl DriverRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `driver`. Registering the same driver again is a no-op and
    /// returns `false`.
    pub fn register(&self, driver: Arc<dyn Driver>) -> bool {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        if drivers.iter().any(|d| same_driver(d, &driver)) {
            return false;
        }
        drivers.push(driver);
        debug!(drivers = drivers.len(), "driver registered");
        true
    }

    /// Remove `driver`. Returns `false` if it was not registered.
    pub fn deregister(&self, driver: &Arc<dyn Driver>) -> bool {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        let before = drivers.len();
        drivers.retain(|d| !same_driver(d, driver));
        let removed = drivers.len() < before;
        if removed {
            debug!(drivers = drivers.len(), "driver deregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First registered driver accepting `url`.
    pub fn driver_for(&self, url: &str) -> Option<Arc<dyn Driver>> {
        self.snapshot().into_iter().find(|d| d.accepts_url(url))
    }

    /// Open `url` with the first driver that takes it.
    ///
    /// A driver error does not stop the search; if no later driver succeeds,
    /// the first error is returned. Without any taker the result is
    /// [`BrokerError::NoSuitableDriver`].
    pub fn connect(&self, url: &str, props: &Properties) -> BrokerResult<Box<dyn Connection>> {
        let mut first_error = None;

        // Connect outside the lock: a broker may block while a server starts.
        for driver in self.snapshot() {
            match driver.connect(url, props) {
                Ok(Some(connection)) => return Ok(connection),
                Ok(None) => {}
                Err(e) => {
                    debug!(url = %url, error = %e, "driver failed to connect");
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or_else(|| BrokerError::NoSuitableDriver(url.to_string())))
    }

    fn snapshot(&self) -> Vec<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for DriverRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRouter")
            .field("drivers", &self.len())
            .finish()
    }
}

/// Identity comparison on the data pointer, ignoring vtables.
fn same_driver(a: &Arc<dyn Driver>, b: &Arc<dyn Driver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
