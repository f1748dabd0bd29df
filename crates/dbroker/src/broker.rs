//! The broker driver.
//!
//! [`Broker`] is a [`Driver`] for the broker URL dialect. A networked URL
//! (`broker+h2:tcp://localhost:<port>/<db>`) counts a connection against its
//! port in the [`ServerRegistry`], which starts the server on first use, and
//! comes back as a [`TrackedConnection`] that gives the port back on close.
//! Other broker URLs are opened on the engine directly. URLs outside the
//! dialect are not the broker's and yield `Ok(None)`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::connection::TrackedConnection;
use crate::engine::{Connection, Driver, Properties, PropertyInfo};
use crate::error::{BrokerError, BrokerResult};
use crate::registry::{Credentials, ServerRegistry};
use crate::router::DriverRouter;
use crate::server::ServerLauncher;
use crate::url::{RewrittenUrl, TcpTarget, UrlDialect};

pub struct Broker {
    dialect: UrlDialect,
    registry: Arc<ServerRegistry>,
    engine: Arc<dyn Driver>,
}

impl Broker {
    /// Create a broker storing server data under `config.base_dir`.
    pub fn new(
        config: &BrokerConfig,
        launcher: Arc<dyn ServerLauncher>,
        engine: Arc<dyn Driver>,
    ) -> Self {
        let registry = ServerRegistry::new(
            &config.base_dir,
            launcher,
            Arc::clone(&engine),
            config.url.clone(),
        );
        Self {
            dialect: config.url.clone(),
            registry: Arc::new(registry),
            engine,
        }
    }

    pub fn dialect(&self) -> &UrlDialect {
        &self.dialect
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Open a connection for a broker URL.
    ///
    /// Returns `Ok(None)` for URLs outside the broker dialect, without touching
    /// the registry. Errors name the phase that failed: [`BrokerError::Format`],
    /// [`BrokerError::Startup`], [`BrokerError::Provisioning`] or
    /// [`BrokerError::Connect`].
    pub fn open(&self, url: &str, props: &Properties) -> BrokerResult<Option<Box<dyn Connection>>> {
        let Some(RewrittenUrl { engine_url, target }) = self.dialect.rewrite(url)? else {
            return Ok(None);
        };

        let connection: Box<dyn Connection> = match target {
            Some(target) => Box::new(self.open_tracked(&engine_url, &target, props)?),
            None => {
                debug!(url = %engine_url, "opening unmanaged connection");
                self.open_engine(&engine_url, props)?
            }
        };
        Ok(Some(connection))
    }

    /// Register with `router`. Returns `false` if already registered.
    pub fn start(self: &Arc<Self>, router: &DriverRouter) -> bool {
        let registered = router.register(Arc::clone(self) as Arc<dyn Driver>);
        if registered {
            info!(prefix = %self.dialect.broker_prefix, "broker registered");
        }
        registered
    }

    /// Deregister from `router` and stop every running server.
    ///
    /// Returns the number of servers stopped.
    pub fn stop(self: &Arc<Self>, router: &DriverRouter) -> usize {
        router.deregister(&(Arc::clone(self) as Arc<dyn Driver>));
        let stopped = self.registry.shutdown();
        info!(prefix = %self.dialect.broker_prefix, stopped, "broker stopped");
        stopped
    }

    fn open_tracked(
        &self,
        engine_url: &str,
        target: &TcpTarget,
        props: &Properties,
    ) -> BrokerResult<TrackedConnection> {
        let credentials = Credentials::from_properties(props);
        let server = self
            .registry
            .acquire(target.port, credentials, &target.database)?;

        match self.open_engine(engine_url, props) {
            Ok(inner) => Ok(TrackedConnection::new(
                inner,
                target.port,
                server.generation,
                Arc::clone(&self.registry),
            )),
            Err(e) => {
                // Nothing holds the slot counted above; give it back.
                if let Err(release_err) = self.registry.release(target.port, server.generation) {
                    warn!(port = target.port, error = %release_err, "failed to release port after connect failure");
                }
                Err(e)
            }
        }
    }

    fn open_engine(&self, engine_url: &str, props: &Properties) -> BrokerResult<Box<dyn Connection>> {
        self.engine
            .connect(engine_url, props)
            .and_then(|c| c.ok_or_else(|| BrokerError::EngineRejected(engine_url.to_string())))
            .map_err(|e| e.into_connect(engine_url))
    }
}

impl Driver for Broker {
    fn connect(&self, url: &str, props: &Properties) -> BrokerResult<Option<Box<dyn Connection>>> {
        self.open(url, props)
    }

    fn accepts_url(&self, url: &str) -> bool {
        self.dialect.accepts(url)
    }

    /// Engine properties for the rewritten URL.
    fn property_info(&self, url: &str, props: &Properties) -> Vec<PropertyInfo> {
        match self.dialect.rewrite(url) {
            Ok(Some(rewritten)) => self.engine.property_info(&rewritten.engine_url, props),
            _ => self.engine.property_info(url, props),
        }
    }

    fn major_version(&self) -> u32 {
        self.engine.major_version()
    }

    fn minor_version(&self) -> u32 {
        self.engine.minor_version()
    }

    fn is_compliant(&self) -> bool {
        self.engine.is_compliant()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("dialect", &self.dialect)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    use crate::test_support::{MockEngine, MockLauncher};

    const URL: &str = "broker+h2:tcp://localhost:1503/mydatabase";

    fn make_broker() -> (Arc<Broker>, MockLauncher, MockEngine) {
        let launcher = MockLauncher::new();
        let engine = MockEngine::new();
        let config = BrokerConfig::default().with_base_dir("/data/h2");
        let broker = Broker::new(&config, Arc::new(launcher.clone()), Arc::new(engine.clone()));
        (Arc::new(broker), launcher, engine)
    }

    // ── open ────────────────────────────────────────────────────────

    #[test]
    fn networked_url_starts_server_and_connects() {
        let (broker, launcher, engine) = make_broker();

        let conn = broker.open(URL, &Properties::new()).unwrap().unwrap();
        assert!(!conn.is_closed());
        assert_eq!(launcher.launches(), 1);
        assert!(launcher.is_running(1503));
        assert_eq!(broker.registry().connection_count(1503), Some(1));
        assert_eq!(
            launcher.log.launched.lock().unwrap()[0],
            (1503, PathBuf::from("/data/h2/tcp-1503"))
        );
        assert_eq!(
            engine.connects(),
            vec![("h2:tcp://localhost:1503/mydatabase".to_string(), None)]
        );
    }

    #[test]
    fn closing_last_connection_stops_server() {
        let (broker, launcher, _) = make_broker();
        let mut conn = broker.open(URL, &Properties::new()).unwrap().unwrap();

        conn.close().unwrap();
        conn.close().unwrap();

        assert_eq!(launcher.terminations(), 1);
        assert!(!broker.registry().is_running(1503));
    }

    #[test]
    fn second_open_reuses_running_server() {
        let (broker, launcher, _) = make_broker();
        let mut first = broker.open(URL, &Properties::new()).unwrap().unwrap();
        let mut second = broker.open(URL, &Properties::new()).unwrap().unwrap();

        assert_eq!(launcher.launches(), 1);
        assert_eq!(broker.registry().connection_count(1503), Some(2));

        first.close().unwrap();
        assert!(launcher.is_running(1503));
        second.close().unwrap();
        assert!(!launcher.is_running(1503));
    }

    #[test]
    fn credentials_are_provisioned_before_connecting() {
        let (broker, _, engine) = make_broker();
        let props = Properties::with_credentials("florent", Some("florentpassword"));

        let _conn = broker.open(URL, &props).unwrap().unwrap();

        let statements: Vec<String> = engine.statements().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            statements,
            vec![
                "DROP USER IF EXISTS florent".to_string(),
                "CREATE USER florent PASSWORD 'florentpassword' ADMIN".to_string(),
            ]
        );
        // Admin connection first, then the caller's.
        let connects = engine.connects();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1].1.as_deref(), Some("florent"));
    }

    #[test]
    fn unmanaged_url_skips_registry() {
        let (broker, launcher, engine) = make_broker();

        let conn = broker.open("broker+h2:mem:scratch", &Properties::new()).unwrap();
        assert!(conn.is_some());
        assert_eq!(launcher.launches(), 0);
        assert!(broker.registry().running_ports().is_empty());
        assert_eq!(engine.connects()[0].0, "h2:mem:scratch");
    }

    #[test]
    fn foreign_url_is_not_ours() {
        let (broker, launcher, engine) = make_broker();

        let conn = broker
            .open("postgres://localhost:5432/db", &Properties::new())
            .unwrap();
        assert!(conn.is_none());
        assert_eq!(launcher.launches(), 0);
        assert!(engine.connects().is_empty());
        assert!(broker.registry().running_ports().is_empty());
    }

    #[test]
    fn malformed_port_is_format_error_without_side_effects() {
        let (broker, launcher, _) = make_broker();

        let err = broker
            .open("broker+h2:tcp://localhost:abc/db", &Properties::new())
            .unwrap_err();
        assert!(matches!(err, BrokerError::Format { .. }));
        assert_eq!(launcher.launches(), 0);
    }

    // ── failures ────────────────────────────────────────────────────

    #[test]
    fn startup_failure_registers_nothing() {
        let (broker, launcher, engine) = make_broker();
        launcher.log.fail_launch.store(true, Ordering::SeqCst);

        let err = broker.open(URL, &Properties::new()).unwrap_err();
        assert!(matches!(err, BrokerError::Startup { port: 1503, .. }));
        assert!(!broker.registry().is_running(1503));
        assert!(engine.connects().is_empty());

        launcher.log.fail_launch.store(false, Ordering::SeqCst);
        assert!(broker.open(URL, &Properties::new()).unwrap().is_some());
        assert_eq!(launcher.launches(), 1);
    }

    #[test]
    fn engine_connect_failure_gives_port_back() {
        let (broker, launcher, engine) = make_broker();
        let _held = broker.open(URL, &Properties::new()).unwrap().unwrap();
        engine.log.fail_connect.store(true, Ordering::SeqCst);

        let err = broker.open(URL, &Properties::new()).unwrap_err();
        assert!(matches!(err, BrokerError::Connect { .. }));
        assert_eq!(broker.registry().connection_count(1503), Some(1));
        assert_eq!(launcher.terminations(), 0);
    }

    #[test]
    fn engine_rejection_on_fresh_port_stops_server() {
        let (broker, launcher, engine) = make_broker();
        engine.log.reject.store(true, Ordering::SeqCst);

        let err = broker.open(URL, &Properties::new()).unwrap_err();
        match err {
            BrokerError::Connect { url, source } => {
                assert_eq!(url, "h2:tcp://localhost:1503/mydatabase");
                assert!(matches!(*source, BrokerError::EngineRejected(_)));
            }
            other => panic!("expected Connect, got {other:?}"),
        }
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.terminations(), 1);
        assert!(!broker.registry().is_running(1503));
    }

    // ── driver surface ──────────────────────────────────────────────

    #[test]
    fn metadata_passes_through_to_engine() {
        let (broker, _, _) = make_broker();
        let props = Properties::with_credentials("florent", None);

        assert!(broker.accepts_url(URL));
        assert!(!broker.accepts_url("h2:mem:x"));
        assert_eq!(broker.major_version(), 2);
        assert_eq!(broker.minor_version(), 3);
        assert!(broker.is_compliant());

        let info = broker.property_info(URL, &props);
        assert_eq!(info[0].value.as_deref(), Some("florent"));
    }

    #[test]
    fn start_and_stop_manage_router_registration() {
        let (broker, launcher, _) = make_broker();
        let router = DriverRouter::new();

        assert!(broker.start(&router));
        assert!(!broker.start(&router));
        assert_eq!(router.len(), 1);

        let conn = router.connect(URL, &Properties::new()).unwrap();
        assert!(launcher.is_running(1503));

        assert_eq!(broker.stop(&router), 1);
        assert!(router.is_empty());
        assert!(!launcher.is_running(1503));

        // The server is already gone; dropping the connection is a no-op release.
        drop(conn);
        assert_eq!(launcher.terminations(), 1);
    }

    #[test]
    fn connection_from_before_restart_does_not_stop_new_server() {
        let (broker, launcher, _) = make_broker();
        let router = DriverRouter::new();
        broker.start(&router);

        let mut old = router.connect(URL, &Properties::new()).unwrap();
        broker.stop(&router);
        broker.start(&router);
        let _fresh = router.connect(URL, &Properties::new()).unwrap();

        old.close().unwrap();
        assert!(launcher.is_running(1503));
        assert_eq!(broker.registry().connection_count(1503), Some(1));
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.terminations(), 1);
    }
}
