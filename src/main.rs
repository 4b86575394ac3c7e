//! Zap CLI - reverse proxy server and client
//!
//! Run `zap server` on a publicly reachable host and `zap client` next to the
//! services you want to expose.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zap_client::ClientConfig;
use zap_control::ServerConfig;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("ZAP_COMMIT"), ")");

/// Zap - expose local services behind NAT through a relay server
#[derive(Parser, Debug)]
#[command(name = "zap")]
#[command(about = "Zap - expose local services behind NAT through a relay server")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "ZAP_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    #[command(long_about = r#"
Run the relay server. Clients log in on the control port and register
proxies; tcp proxies get a public port on this host.

EXAMPLES:
  zap server --config zaps.json
  zap server --bind-port 7000 --token $ZAP_TOKEN

ENVIRONMENT VARIABLES:
  ZAP_TOKEN      Shared authentication token
    "#)]
    Server {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Control listener address
        #[arg(long)]
        bind_addr: Option<String>,

        /// Control listener port
        #[arg(long)]
        bind_port: Option<u16>,

        /// Authentication token
        #[arg(long, env = "ZAP_TOKEN")]
        token: Option<String>,
    },

    /// Connect to a relay server and serve the configured proxies
    Client {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Server address
        #[arg(long)]
        server_addr: Option<String>,

        /// Server control port
        #[arg(long)]
        server_port: Option<u16>,

        /// Authentication token
        #[arg(long, env = "ZAP_TOKEN")]
        token: Option<String>,
    },
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

async fn run_server(
    config: Option<PathBuf>,
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    token: Option<String>,
) -> Result<()> {
    let mut config: ServerConfig = match config {
        Some(path) => load_json(&path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = bind_addr {
        config.bind_addr = addr;
    }
    if let Some(port) = bind_port {
        config.bind_port = port;
    }
    if let Some(token) = token {
        config.auth.token = token;
    }

    let service = Arc::new(
        zap_control::Service::new(config)
            .await
            .context("Failed to start server")?,
    );
    info!(addr = ?service.local_addr().ok(), "Zap server starting");

    let runner = service.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
        result = &mut run => {
            if let Err(e) = result {
                error!("Server task panicked: {}", e);
            }
        }
    }

    service.close().await;
    info!("Zap server stopped");
    Ok(())
}

async fn run_client(
    config: Option<PathBuf>,
    server_addr: Option<String>,
    server_port: Option<u16>,
    token: Option<String>,
) -> Result<()> {
    let mut config = match config {
        Some(path) => ClientConfig::from_file(&path)?,
        None => ClientConfig::default(),
    };
    if let Some(addr) = server_addr {
        config.server_addr = addr;
    }
    if let Some(port) = server_port {
        config.server_port = port;
    }
    if let Some(token) = token {
        config.auth.token = token;
    }

    info!(
        server = %config.server_address(),
        proxies = config.proxies.len(),
        visitors = config.visitors.len(),
        "Zap client starting"
    );
    let service = zap_client::Service::new(config).context("Invalid client configuration")?;

    let runner = service.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            service.close();
            Ok(())
        }
        result = &mut run => match result {
            Ok(result) => result.context("Client stopped"),
            Err(e) => Err(anyhow::anyhow!("Client task panicked: {}", e)),
        },
    };

    info!("Zap client stopped");
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    info!(version = VERSION, "zap");

    match cli.command {
        Commands::Server {
            config,
            bind_addr,
            bind_port,
            token,
        } => run_server(config, bind_addr, bind_port, token).await,
        Commands::Client {
            config,
            server_addr,
            server_port,
            token,
        } => run_client(config, server_addr, server_port, token).await,
    }
}
