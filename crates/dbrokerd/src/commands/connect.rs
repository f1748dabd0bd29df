use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dbroker::{
    Broker, BrokerConfig, CommandLauncher, Connection, DriverRouter, Properties, TcpEngineDriver,
};
use tracing::{info, warn};

/// One `connect` invocation.
pub struct Session {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub statements: Vec<String>,
    pub hold_secs: u64,
}

impl Session {
    fn properties(&self) -> Properties {
        match &self.user {
            Some(user) => Properties::with_credentials(user, self.password.as_deref()),
            None => Properties::new(),
        }
    }
}

pub async fn run(config: BrokerConfig, session: Session) -> anyhow::Result<()> {
    let launcher = Arc::new(CommandLauncher::from_config(&config.server));
    let engine = Arc::new(TcpEngineDriver::from_config(&config));
    let broker = Arc::new(Broker::new(&config, launcher, engine.clone()));

    // Broker first so its URLs never reach the plain engine driver.
    let router = Arc::new(DriverRouter::new());
    broker.start(&router);
    router.register(engine);
    info!(base_dir = ?config.base_dir, "broker started");

    let result = run_session(Arc::clone(&router), session).await;

    let stopped = tokio::task::spawn_blocking({
        let broker = Arc::clone(&broker);
        let router = Arc::clone(&router);
        move || broker.stop(&router)
    })
    .await?;
    info!(stopped, "broker stopped");

    result
}

async fn run_session(router: Arc<DriverRouter>, session: Session) -> anyhow::Result<()> {
    run_session_until(router, session, tokio::signal::ctrl_c()).await
}

/// Run `session`, ending a hold early when `interrupt` completes.
async fn run_session_until<F>(
    router: Arc<DriverRouter>,
    session: Session,
    interrupt: F,
) -> anyhow::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let props = session.properties();
    let url = session.url.clone();

    let mut connection = tokio::task::spawn_blocking(move || router.connect(&url, &props))
        .await?
        .with_context(|| format!("failed to open '{}'", session.url))?;
    info!(url = %session.url, "connection open");

    let statements = session.statements;
    let (mut connection, executed) = tokio::task::spawn_blocking(move || {
        let executed = execute_all(connection.as_mut(), &statements);
        (connection, executed)
    })
    .await?;

    let held = if executed.is_ok() && session.hold_secs > 0 {
        hold(Duration::from_secs(session.hold_secs), interrupt).await
    } else {
        Ok(())
    };

    // Closing blocks on the registry, so it stays off the runtime threads even
    // when the hold failed.
    let closed = tokio::task::spawn_blocking(move || connection.close()).await?;
    if let Err(e) = &closed {
        warn!(error = %e, "connection did not close cleanly");
    }

    executed?;
    held?;
    closed?;
    Ok(())
}

/// Wait for `duration` or `interrupt`, whichever comes first.
async fn hold<F>(duration: Duration, interrupt: F) -> anyhow::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    info!(secs = duration.as_secs(), "holding connection open, Ctrl-C to close");
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        signal = interrupt => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupted");
            Ok(())
        }
    }
}

/// Run `statements` in order, printing each reply. Stops at the first failure.
fn execute_all(connection: &mut dyn Connection, statements: &[String]) -> anyhow::Result<()> {
    for statement in statements {
        let reply = connection
            .execute(statement)
            .with_context(|| format!("statement failed: {statement}"))?;
        println!("{reply}");
    }
    Ok(())
}
