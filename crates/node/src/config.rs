//! Startup configuration: command line, optional TOML file, defaults.
//!
//! Command-line flags win over file values, which win over defaults. The
//! result is validated once and is read-only afterwards.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use powd_chainstate::validation::valid_coin_tag;
use powd_consensus::constants::DEFAULT_COIN;
use powd_consensus::params::{chain_params, Network};
use powd_primitives::transaction::OwnerHash;
use serde::Deserialize;

use crate::logging;
use crate::wire::from_hex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Validates and relays.
    Full,
    /// Validates, relays and mines.
    Miner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Fjall,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Parser)]
#[command(name = "powd", version, about = "Proof-of-work blockchain node")]
pub struct Cli {
    /// TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// mainnet, testnet or regtest.
    #[arg(long)]
    pub network: Option<String>,
    #[arg(long, value_enum)]
    pub node_type: Option<NodeType>,
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Do not accept inbound connections.
    #[arg(long)]
    pub no_listen: bool,
    /// Bootstrap peer as host:port. Repeatable.
    #[arg(long = "bootstrap")]
    pub bootstrap: Vec<String>,
    /// 40 hex characters: hash160 of the mining public key.
    #[arg(long)]
    pub mining_address: Option<String>,
    #[arg(long)]
    pub coin: Option<String>,
    #[arg(long)]
    pub max_peers: Option<usize>,
    #[arg(long)]
    pub max_workers: Option<usize>,
    #[arg(long)]
    pub mempool_max_txs: Option<usize>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub log_format: Option<String>,
    #[arg(long)]
    pub no_log_timestamps: bool,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,
    /// Seconds between status lines; 0 disables them.
    #[arg(long)]
    pub status_interval_secs: Option<u64>,
    /// Give up on one block template after this many seconds; 0 disables.
    #[arg(long)]
    pub mine_deadline_secs: Option<u64>,
}

/// Keys accepted in the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub network: Option<String>,
    pub node_type: Option<NodeType>,
    pub listen: Option<SocketAddr>,
    pub no_listen: Option<bool>,
    pub bootstrap: Option<Vec<String>>,
    pub mining_address: Option<String>,
    pub coin: Option<String>,
    pub max_peers: Option<usize>,
    pub max_workers: Option<usize>,
    pub mempool_max_txs: Option<usize>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_timestamps: Option<bool>,
    pub data_dir: Option<PathBuf>,
    pub backend: Option<Backend>,
    pub status_interval_secs: Option<u64>,
    pub mine_deadline_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Timeouts and loop periods of the gossip layer.
#[derive(Clone, Debug)]
pub struct NetTimings {
    pub dial: Duration,
    pub handshake: Duration,
    pub read: Duration,
    pub write: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub probe_interval: Duration,
    /// How long probes must keep failing before a peer counts as partitioned.
    pub partition_timeout: Duration,
    pub recovery_interval: Duration,
    pub sync_interval: Duration,
    pub ban_secs: u64,
}

impl Default for NetTimings {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(10),
            handshake: Duration::from_secs(15),
            read: Duration::from_secs(90),
            write: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(15),
            partition_timeout: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(10),
            ban_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub network: Network,
    pub node_type: NodeType,
    pub listen: Option<SocketAddr>,
    pub bootstrap: Vec<String>,
    pub mining_owner: Option<OwnerHash>,
    pub coin: String,
    pub max_peers: usize,
    pub max_workers: usize,
    pub mempool_max_txs: usize,
    pub log: logging::LogConfig,
    pub data_dir: PathBuf,
    pub backend: Backend,
    pub status_interval: Option<Duration>,
    pub mine_deadline: Option<Duration>,
    pub net: NetTimings,
}

impl NodeConfig {
    /// Defaults for `network` with nothing overridden.
    pub fn new(network: Network) -> Self {
        let params = chain_params(network);
        Self {
            network,
            node_type: NodeType::Full,
            listen: Some(SocketAddr::from(([0, 0, 0, 0], params.default_port))),
            bootstrap: params
                .bootstrap_peers
                .iter()
                .map(|peer| peer.to_string())
                .collect(),
            mining_owner: None,
            coin: DEFAULT_COIN.to_string(),
            max_peers: 16,
            max_workers: num_cpus::get().max(1),
            mempool_max_txs: 5_000,
            log: logging::LogConfig::default(),
            data_dir: PathBuf::from("data"),
            backend: Backend::Memory,
            status_interval: Some(Duration::from_secs(30)),
            mine_deadline: Some(Duration::from_secs(120)),
            net: NetTimings::default(),
        }
    }

    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    /// Layers `cli` over `file` over the network defaults.
    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let network_name = cli
            .network
            .or(file.network)
            .unwrap_or_else(|| Network::Mainnet.as_str().to_string());
        let network = Network::parse(&network_name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown network {network_name:?}")))?;
        let mut config = Self::new(network);

        if let Some(node_type) = cli.node_type.or(file.node_type) {
            config.node_type = node_type;
        }
        if let Some(listen) = cli.listen.or(file.listen) {
            config.listen = Some(listen);
        }
        if cli.no_listen || file.no_listen.unwrap_or(false) {
            config.listen = None;
        }
        if !cli.bootstrap.is_empty() {
            config.bootstrap = cli.bootstrap;
        } else if let Some(bootstrap) = file.bootstrap {
            config.bootstrap = bootstrap;
        }
        if let Some(address) = cli.mining_address.or(file.mining_address) {
            config.mining_owner = Some(parse_owner(&address)?);
        }
        if let Some(coin) = cli.coin.or(file.coin) {
            config.coin = coin;
        }
        if let Some(max_peers) = cli.max_peers.or(file.max_peers) {
            config.max_peers = max_peers;
        }
        if let Some(max_workers) = cli.max_workers.or(file.max_workers) {
            config.max_workers = max_workers;
        }
        if let Some(max_txs) = cli.mempool_max_txs.or(file.mempool_max_txs) {
            config.mempool_max_txs = max_txs;
        }
        if let Some(raw) = cli.log_level.or(file.log_level) {
            config.log.level = logging::Level::parse(&raw)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown log level {raw:?}")))?;
        }
        if let Some(raw) = cli.log_format.or(file.log_format) {
            config.log.format = logging::Format::parse(&raw)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown log format {raw:?}")))?;
        }
        if cli.no_log_timestamps {
            config.log.timestamps = false;
        } else if let Some(timestamps) = file.log_timestamps {
            config.log.timestamps = timestamps;
        }
        if let Some(data_dir) = cli.data_dir.or(file.data_dir) {
            config.data_dir = data_dir;
        }
        if let Some(backend) = cli.backend.or(file.backend) {
            config.backend = backend;
        }
        if let Some(secs) = cli.status_interval_secs.or(file.status_interval_secs) {
            config.status_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = cli.mine_deadline_secs.or(file.mine_deadline_secs) {
            config.mine_deadline = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".to_string()));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".to_string()));
        }
        if self.mempool_max_txs == 0 {
            return Err(ConfigError::Invalid(
                "mempool_max_txs must be at least 1".to_string(),
            ));
        }
        for peer in &self.bootstrap {
            validate_host_port(peer)?;
        }
        if !valid_coin_tag(&self.coin) {
            return Err(ConfigError::Invalid(format!(
                "coin tag {:?} must be 1-8 uppercase letters or digits",
                self.coin
            )));
        }
        if self.node_type == NodeType::Miner && self.mining_owner.is_none() {
            return Err(ConfigError::Invalid(
                "node_type=miner requires a mining_address".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses a 40-hex-character owner commitment.
pub fn parse_owner(raw: &str) -> Result<OwnerHash, ConfigError> {
    let trimmed = raw.trim();
    let invalid =
        || ConfigError::Invalid(format!("mining address {trimmed:?} is not 40 hex chars"));
    if trimmed.len() != 40 {
        return Err(invalid());
    }
    let bytes = from_hex(trimmed).ok_or_else(invalid)?;
    let mut owner = [0u8; 20];
    owner.copy_from_slice(&bytes);
    Ok(owner)
}

fn validate_host_port(raw: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("bootstrap peer {raw:?} is not host:port"));
    if raw.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }
    let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains(':') || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}
