//! # Handshake Server Binary
//!
//! Generates one ML-KEM-768 key pair at startup and answers every
//! connection with a single handshake.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use kem_handshake::{config, ConcurrencyMode, MlKem768Kem, Responder, ServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// ML-KEM-768 handshake responder
#[derive(Parser)]
#[command(name = "kem-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(short, long)]
    bind: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// How accepted connections are scheduled
    #[arg(long, value_enum, value_name = "MODE")]
    concurrency: Option<ConcurrencyMode>,

    /// Exit after this many connections
    #[arg(long)]
    max_connections: Option<u64>,

    /// Per-receive deadline in seconds
    #[arg(long, value_name = "SECS")]
    read_timeout: Option<u64>,

    /// Per-send deadline in seconds
    #[arg(long, value_name = "SECS")]
    write_timeout: Option<u64>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    print_config: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        // Flags override file values
        if let Some(host) = &self.bind {
            cfg.listen.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.listen.port = port;
        }
        if let Some(mode) = self.concurrency {
            cfg.connection.concurrency = mode;
        }
        if self.max_connections.is_some() {
            cfg.connection.max_connections = self.max_connections;
        }
        if self.read_timeout.is_some() {
            cfg.connection.read_timeout_secs = self.read_timeout;
        }
        if self.write_timeout.is_some() {
            cfg.connection.write_timeout_secs = self.write_timeout;
        }

        cfg.validate().context("Invalid configuration")?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", config::generate_sample());
        return Ok(());
    }

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install logger")?;

    let cfg = cli.server_config()?;
    info!(mode = ?cfg.connection.concurrency, "Starting responder");

    let responder = Responder::bind(cfg, MlKem768Kem::new())
        .await
        .context("Failed to start responder")?;

    let stats = responder
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!(
        "Served {} connection(s): {} ok, {} failed",
        stats.accepted, stats.succeeded, stats.failed
    );
    Ok(())
}
