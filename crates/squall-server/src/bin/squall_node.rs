//! The squall node binary.
//!
//! Configuration comes from an optional JSON file plus command-line / env
//! overrides for the common knobs. The node runs until SIGINT/SIGTERM and
//! then shuts down gracefully.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use squall_server::{Node, NodeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "squall-node", about = "Squall data grid node", version)]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(long, env = "SQUALL_CONFIG")]
    config: Option<PathBuf>,

    /// Unique node id (overrides the config file).
    #[arg(long, env = "SQUALL_NODE_ID")]
    node_id: Option<String>,

    /// Client WebSocket port.
    #[arg(long, env = "SQUALL_PORT")]
    port: Option<u16>,

    /// Cluster TCP port.
    #[arg(long, env = "SQUALL_CLUSTER_PORT")]
    cluster_port: Option<u16>,

    /// Seed peers as host:clusterPort, comma separated.
    #[arg(long, env = "SQUALL_PEERS", value_delimiter = ',')]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<NodeConfig>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => NodeConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(cluster_port) = args.cluster_port {
        config.cluster_port = cluster_port;
    }
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }

    let node = Node::start(config).await?;

    // Run until the process is told to stop.
    shutdown_signal().await;
    node.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut stream) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
