//! Fleetbox Node - Main entry point
//!
//! Loads configuration, opens the settings database under the root folder,
//! starts the node and serves the control API until Ctrl+C or SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetbox_common::config::{resolve_root_folder, ROOT_FOLDER_ENV};
use fleetbox_node::api::{self, AppContext};
use fleetbox_node::config::NodeConfig;
use fleetbox_node::download::HttpMediaSource;
use fleetbox_node::playback::SimulatedOutput;
use fleetbox_node::{db, Node};

const DEFAULT_LOG_FILTER: &str = "fleetbox_node=debug,tower_http=info";

/// Command-line arguments for fleetbox-node
#[derive(Parser, Debug)]
#[command(name = "fleetbox-node")]
#[command(about = "Media delivery and playback node for Fleetbox devices")]
#[command(version)]
struct Args {
    /// Config file (defaults to the platform location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root folder for media and the settings database
    #[arg(short, long, env = ROOT_FOLDER_ENV)]
    root_folder: Option<PathBuf>,

    /// Port for the control API
    #[arg(short, long, env = "FLEETBOX_PORT")]
    port: Option<u16>,

    /// Device token reported in status messages
    #[arg(long, env = "FLEETBOX_TOKEN")]
    token: Option<String>,

    /// Base URL of the media library
    #[arg(long, env = "FLEETBOX_MEDIA_URL")]
    media_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(token) = args.token {
        config.device.token = token;
    }
    if let Some(url) = args.media_url {
        config.device.media_base_url = url;
    }

    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match &config.logging.level {
            Some(level) => EnvFilter::try_new(level),
            None => EnvFilter::try_new(DEFAULT_LOG_FILTER),
        })
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root = resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        config.root_folder.as_deref(),
    );
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create root folder {}", root.display()))?;
    info!("Root folder: {}", root.display());

    let pool = db::connect(&root.join("fleetbox.db"))
        .await
        .context("Failed to open settings database")?;

    let source = HttpMediaSource::new(
        &config.device.media_base_url,
        config.download.request_timeout(),
    )
    .context("Failed to create media client")?;

    let node = Node::start(
        &config,
        &root,
        Arc::new(source),
        Arc::new(SimulatedOutput::new()),
        pool,
    )
    .await
    .context("Failed to start node")?;
    let node = Arc::new(node);

    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind))?;
    let addr = SocketAddr::new(ip, config.server.port);

    let served = api::run(addr, AppContext { node: node.clone() }, shutdown_signal()).await;

    node.shutdown().await;
    served.context("Control API failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
