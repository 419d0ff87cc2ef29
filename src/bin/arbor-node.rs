//! Node daemon: start an endpoint from config and serve until signalled.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

use arbor::{ClusterContextBuilder, MemoryTree, NodeConfig, ServerEndpoint, telemetry};

#[derive(Parser)]
#[command(name = "arbor-node", about = "Clustered replicated asset tree node", version)]
struct Cli {
    /// Path to the node config (defaults apply when omitted).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listening port (0 = ephemeral).
    #[arg(long)]
    port: Option<u16>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose.max(1));

    if let Err(err) = run(cli) {
        tracing::error!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> arbor::Result<()> {
    let config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => {
            let config = NodeConfig::default();
            config.validate()?;
            config
        }
    };

    let host = config.host()?;
    let tree = Arc::new(MemoryTree::new(host));
    let cluster = Arc::new(ClusterContextBuilder::from_config(&config).build()?);
    cluster.bind_tree(tree)?;

    let mut endpoint = ServerEndpoint::new(cluster);
    let port = endpoint.start(cli.port.unwrap_or(config.transport.port))?;
    tracing::info!(port, host = %host, name = %config.name, "node up");

    for peer in &config.peers {
        match endpoint.connect_peer(&peer.addr) {
            Ok(conn) => tracing::info!(peer = peer.host_id, addr = %peer.addr, %conn, "peer connection started"),
            Err(err) => tracing::warn!(peer = peer.host_id, addr = %peer.addr, "peer connection failed: {err}"),
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    tracing::info!("shutdown signal received");
    endpoint.close();
    Ok(())
}
