use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use slotline::cluster::ClusterProxy;
use slotline::config::{ConfigManager, ProxyConfig};
use slotline::{metrics, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "slotline", version, about = "A clustered key-value proxy")]
struct Args {
    /// Path to the proxy configuration file; the proxy rewrites it to
    /// persist its id and the registered routers.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the listening port from the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Expose prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("{err:#}");
        process::exit(1);
    }
    process::exit(0);
}

async fn run(args: Args) -> Result<()> {
    let manager = ConfigManager::new(&args.config);
    manager.ensure_writable()?;

    let config = ProxyConfig::load(manager.path()).await?;
    config.ensure_valid()?;

    if let Some(addr) = args.metrics_addr {
        metrics::serve(addr).await?;
    }

    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    let proxy = ClusterProxy::bootstrap(&config, manager, port).await?;

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind proxy listener on port {port}"))?;
    info!(port, "proxy listening");

    tokio::select! {
        result = proxy.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        _ = proxy.state().shutdown_requested() => {
            info!("shutdown requested by client");
        }
    }
    Ok(())
}
