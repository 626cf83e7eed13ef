//! passtor - distributed password store node

use anyhow::{Context, Result};
use clap::Parser;
use passtor_core::parse_peers;
use passtor_node::{Config, Passtor};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "passtor")]
#[command(about = "Distributed password store node", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the passtor instance
    #[arg(long)]
    name: Option<String>,

    /// Address used to communicate with other passtor instances
    #[arg(long)]
    addr: Option<String>,

    /// Address clients connect to
    #[arg(long)]
    client_addr: Option<String>,

    /// Bootstrap peer addresses, comma separated
    #[arg(long)]
    peers: Option<String>,

    /// Verbosity: 0 = warnings, 1 = info, 2 = debug
    #[arg(short, long)]
    verbosity: Option<u8>,
}

impl Cli {
    /// File values (or defaults) overridden by command line flags
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(addr) = self.addr {
            config.addr = addr.parse().with_context(|| format!("invalid --addr {addr}"))?;
        }
        if let Some(addr) = self.client_addr {
            config.client_addr = addr
                .parse()
                .with_context(|| format!("invalid --client-addr {addr}"))?;
        }
        if let Some(peers) = self.peers {
            config.peers = parse_peers(&peers).context("invalid --peers")?;
        }
        if let Some(verbosity) = self.verbosity {
            config.verbosity = verbosity;
        }
        Ok(config)
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;
    init_logging(config.verbosity);

    let passtor = Passtor::new(&config.node_name(), config.addr, config.dht_config())
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    let clients = TcpListener::bind(config.client_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.client_addr))?;

    passtor.listen();
    passtor.spawn_client_listener(clients);
    passtor.join(&config.peers).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
