//! xyzFS Storage Node Daemon
//!
//! Runs a storage node that:
//! - Stores files in erasure-coded shard blocks on local volumes
//! - Discovers peers through gossip and exchanges shard indices with them
//! - Replicates writes to peers over the binary transport
//! - Optionally exposes Prometheus metrics

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xyzfs_node::{init_metrics, AppContext, MetricsServer, NodeConfig};

#[derive(Parser)]
#[command(name = "xyzfs-node")]
#[command(about = "xyzFS storage node daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "xyzfs.toml")]
    config: PathBuf,

    /// Gossip seeds, comma separated `host[:port]` (overrides config file)
    #[arg(short, long, value_delimiter = ',')]
    seeds: Option<Vec<String>>,

    /// Address to bind every service to (overrides config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("xyzFS node starting...");

    // Priority: CLI args > environment > config file > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.seeds, cli.bind);
    config.validate().context("invalid configuration")?;

    init_metrics();
    if config.metrics.enabled {
        MetricsServer::new(&config.node.bind_address, config.metrics.port)
            .and_then(|server| server.start())
            .map_err(|e| anyhow::anyhow!("metrics exporter: {e}"))?;
    }

    let context = AppContext::build(config).context("failed to build node")?;
    let addrs = context.start().await.context("failed to start node")?;

    let config = context.config();
    info!("========================================");
    info!("  Runtime ID:  {}", context.runtime().id());
    info!("  Gossip:      {}", addrs.gossip);
    info!("  Binary:      {}", addrs.binary);
    info!("  Binary UDP:  {}", config.network.binary_udp_port);
    info!("  Volumes:     {:?}", config.storage.volume_path);
    info!("  Meta:        {:?}", config.storage.meta_path);
    info!(
        "  Erasure:     {} data + {} parity",
        config.storage.data_shards, config.storage.parity_shards
    );
    info!("  Replicas:    {}", config.storage.replicas);
    info!("========================================");
    info!("Press Ctrl+C to shut down");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    context.shutdown().await;
    info!("xyzFS node stopped");
    Ok(())
}
