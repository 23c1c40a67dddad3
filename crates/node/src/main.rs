//! keyspace-node: entry point for a cluster node.
//!
//! Loads config (flags override an optional YAML file), recovers the
//! storage engine from its WAL, wires membership callbacks into the
//! hash ring, then serves the wire protocol until Ctrl+C.

use clap::Parser;
use keyspace_common::NodeInfo;
use keyspace_config::NodeConfig;
use keyspace_kv::{Coordinator, QuorumConfig};
use keyspace_membership::{MembershipConfig, MembershipManager};
use keyspace_net::TcpPeerClient;
use keyspace_ring::HashRing;
use keyspace_storage::StorageEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "keyspace-node", about = "A node of the keyspace distributed KV store")]
struct Args {
    /// Unique node identifier.
    #[arg(long)]
    node_id: Option<String>,

    /// Host to bind and advertise.
    #[arg(long)]
    host: Option<String>,

    /// Listening port.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory; the WAL lives at <data-dir>/<node-id>/wal.log.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seed node address as host:port (repeatable).
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Replication factor (N).
    #[arg(short = 'n', long)]
    replication_factor: Option<usize>,

    /// Read quorum (R).
    #[arg(short = 'r', long)]
    read_quorum: Option<usize>,

    /// Write quorum (W).
    #[arg(short = 'w', long)]
    write_quorum: Option<usize>,

    /// Log level when RUST_LOG is unset: debug|info|warn|error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Prometheus metrics port.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Optional YAML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig, keyspace_config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => keyspace_config::load_from_file(path)?,
            None => NodeConfig::for_node("node1"),
        };

        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if !self.seeds.is_empty() {
            config.seeds = self.seeds;
        }
        if let Some(n) = self.replication_factor {
            config.replication.n = n;
        }
        if let Some(r) = self.read_quorum {
            config.replication.r = r;
        }
        if let Some(w) = self.write_quorum {
            config.replication.w = w;
        }
        if self.metrics_port.is_some() {
            config.metrics_port = self.metrics_port;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    keyspace_metrics::init_tracing(&args.log_level);

    let config = args.into_config()?;

    tracing::info!(
        node_id = %config.node_id,
        addr = %format!("{}:{}", config.host, config.port),
        data_dir = %config.node_data_dir().display(),
        n = config.replication.n,
        r = config.replication.r,
        w = config.replication.w,
        seeds = config.seeds.len(),
        "keyspace node starting"
    );
    if !config.is_strongly_consistent() {
        tracing::warn!(
            "R+W <= N: running eventually consistent (strong consistency needs R+W > N)"
        );
    }

    // Storage engine, recovered from its WAL before serving traffic.
    let storage = Arc::new(StorageEngine::open(&config.node_data_dir())?);
    storage.recover()?;

    // Hash ring seeded with ourselves; membership callbacks keep it in sync.
    let ring = Arc::new(HashRing::new(config.ring.virtual_nodes));
    ring.add_node(&config.node_id);

    let peer_client = Arc::new(TcpPeerClient::new(Duration::from_millis(
        config.replication.connect_timeout_ms,
    )));

    let seeds = config
        .seeds
        .iter()
        .map(|s| keyspace_config::parse_seed(s))
        .collect::<Result<Vec<_>, _>>()?;
    let membership = Arc::new(MembershipManager::new(
        NodeInfo::new(&config.node_id, &config.host, config.port),
        seeds,
        peer_client.clone(),
        MembershipConfig {
            interval: Duration::from_millis(config.gossip.interval_ms),
            failure_timeout_ms: config.gossip.failure_timeout_ms,
            fanout: config.gossip.fanout,
        },
    ));
    {
        let ring_join = ring.clone();
        membership.set_on_join(move |node| {
            ring_join.add_node(&node.node_id);
        });
        let ring_leave = ring.clone();
        membership.set_on_leave(move |node_id| {
            ring_leave.remove_node(node_id);
        });
    }

    let coordinator = Arc::new(Coordinator::new(
        config.node_id.clone(),
        storage,
        ring,
        membership.clone(),
        peer_client,
        QuorumConfig {
            n: config.replication.n,
            r: config.replication.r,
            w: config.replication.w,
        },
    ));

    // Metrics endpoint, if asked for.
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: std::net::SocketAddr = format!("0.0.0.0:{metrics_port}").parse()?;
        tokio::spawn(async move {
            if let Err(e) = keyspace_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!(error = %e, "metrics server failed");
            }
        });
    }

    // Wire protocol listener.
    let listener =
        tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(keyspace_net::serve(
        listener,
        coordinator,
        shutdown.clone(),
    ));

    membership.start();
    tracing::info!(node_id = %config.node_id, port = config.port, "node ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping gracefully");

    membership.stop().await;
    shutdown.cancel();
    let _ = server.await;

    tracing::info!(node_id = %config.node_id, "node stopped");
    Ok(())
}
