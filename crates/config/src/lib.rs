//! Configuration schema and loader for keyspace nodes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub node_id: String,

    /// Host to bind and advertise.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listening port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory for per-node data; the WAL lives at
    /// `<data_dir>/<node_id>/wal.log`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bootstrap seed addresses as `host:port`.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Quorum settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Gossip / failure-detection settings.
    #[serde(default)]
    pub gossip: GossipConfig,

    /// Ring settings.
    #[serde(default)]
    pub ring: RingConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication factor (N).
    #[serde(default = "default_n")]
    pub n: usize,

    /// Read quorum (R).
    #[serde(default = "default_r")]
    pub r: usize,

    /// Write quorum (W).
    #[serde(default = "default_w")]
    pub w: usize,

    /// Per-call TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            n: default_n(),
            r: default_r(),
            w: default_w(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Gossip round period in milliseconds.
    #[serde(default = "default_gossip_interval_ms")]
    pub interval_ms: u64,

    /// Silence after which a peer is marked dead, in milliseconds.
    #[serde(default = "default_failure_timeout_ms")]
    pub failure_timeout_ms: u64,

    /// Peers contacted per round.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_gossip_interval_ms(),
            failure_timeout_ms: default_failure_timeout_ms(),
            fanout: default_fanout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Virtual positions per physical node.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

// --- Defaults ---

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_n() -> usize {
    3
}
fn default_r() -> usize {
    2
}
fn default_w() -> usize {
    2
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_gossip_interval_ms() -> u64 {
    1000
}
fn default_failure_timeout_ms() -> u64 {
    5000
}
fn default_fanout() -> usize {
    2
}
fn default_virtual_nodes() -> usize {
    150
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// A config with every field at its default, for the given node id.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            seeds: Vec::new(),
            replication: ReplicationConfig::default(),
            gossip: GossipConfig::default(),
            ring: RingConfig::default(),
            metrics_port: None,
        }
    }

    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.replication.n == 0 {
            return Err(ConfigError::Invalid("replication.n must be > 0".into()));
        }
        if self.replication.r == 0 || self.replication.r > self.replication.n {
            return Err(ConfigError::Invalid(format!(
                "replication.r ({}) must be in 1..=n ({})",
                self.replication.r, self.replication.n
            )));
        }
        if self.replication.w == 0 || self.replication.w > self.replication.n {
            return Err(ConfigError::Invalid(format!(
                "replication.w ({}) must be in 1..=n ({})",
                self.replication.w, self.replication.n
            )));
        }
        if self.ring.virtual_nodes == 0 {
            return Err(ConfigError::Invalid("ring.virtual_nodes must be > 0".into()));
        }
        for seed in &self.seeds {
            parse_seed(seed)?;
        }
        Ok(())
    }

    /// Whether R + W > N holds; when it does not, reads may miss the
    /// latest write and the node should say so at startup.
    pub fn is_strongly_consistent(&self) -> bool {
        self.replication.r + self.replication.w > self.replication.n
    }

    /// Directory holding this node's WAL.
    pub fn node_data_dir(&self) -> PathBuf {
        self.data_dir.join(&self.node_id)
    }
}

/// Split a `host:port` seed address.
pub fn parse_seed(seed: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = seed
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("seed '{seed}' is not host:port")))?;
    if host.is_empty() {
        return Err(ConfigError::Invalid(format!("seed '{seed}' has an empty host")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("seed '{seed}' has an invalid port")))?;
    Ok((host.to_string(), port))
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
