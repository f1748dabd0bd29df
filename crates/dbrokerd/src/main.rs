//! dbrokerd: command-line front end for the connection broker.
//!
//! # Usage
//!
//! ```text
//! dbrokerd rewrite broker+h2:tcp://localhost:1503/mydatabase
//! dbrokerd --config dbroker.toml connect broker+h2:tcp://localhost:1503/mydatabase \
//!     --user florent --password florentpassword -e "SELECT 1" --hold 30
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dbroker::BrokerConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "dbrokerd",
    about = "Database connection broker",
    version,
    propagate_version = true,
)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the base storage directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show how a broker URL is rewritten for the engine
    Rewrite {
        url: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Open a connection through the broker, run statements, then close it.
    ///
    /// The server behind a `tcp://localhost:<port>` URL is started on open
    /// and stopped when the connection closes.
    Connect {
        url: String,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        password: Option<String>,
        /// Statement to execute; may be repeated
        #[arg(short = 'e', long = "execute")]
        statements: Vec<String>,
        /// Seconds to keep the connection open (Ctrl-C closes early)
        #[arg(long, default_value = "0")]
        hold: u64,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dbroker=debug,dbrokerd=debug"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = load_config(cli.config.as_deref(), cli.base_dir)?;

    match cli.command {
        Command::Rewrite { url, format } => commands::rewrite::run(&config, &url, &format),
        Command::Connect {
            url,
            user,
            password,
            statements,
            hold,
        } => {
            let session = commands::connect::Session {
                url,
                user,
                password,
                statements,
                hold_secs: hold,
            };
            commands::connect::run(config, session).await
        }
        Command::ShowConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>, base_dir: Option<PathBuf>) -> anyhow::Result<BrokerConfig> {
    let config = match path {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };
    Ok(match base_dir {
        Some(base_dir) => config.with_base_dir(base_dir),
        None => config,
    })
}
