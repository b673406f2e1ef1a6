//! Node configuration.
//!
//! Each component owns its own config struct with defaults and `with_*`
//! builders; [`NodeConfig`] aggregates them with the node identity and the
//! network and storage locations. [`NodeConfig::from_env`] reads:
//!
//! - `WORKER_ID`: numeric peer id in `1..=PEER_COUNT` (default 1)
//! - `NODE_ID`: node label (default `node-<WORKER_ID>`)
//! - `PEER_COUNT`: size of the static peer set (default 4)
//! - `PEER_HOST`: host serving every peer (default `localhost`)
//! - `BASE_PORT`: port of peer 1; peer `n` listens on `BASE_PORT + n - 1` (default 5000)
//! - `PORT`: this node's listen port (default derived from `BASE_PORT`)
//! - `DATA_DIR`: root of the checkpoint and log directories (default `data`)
//! - `METRICS_ADDR`: Prometheus listener address (default disabled)

use crate::batch::BatchConfig;
use crate::checkpoint::CheckpointConfig;
use crate::delivery::DeliveryConfig;
use crate::election::{ElectionConfig, PeerId};
use crate::oplog::OpLogConfig;
use crate::recovery::RecoveryConfig;
use crate::sync::SyncConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// A variable holds a value of the wrong shape.
  #[error("invalid value {value:?} for {key}: {reason}")]
  Invalid {
    /// Variable name.
    key: &'static str,
    /// Raw value.
    value: String,
    /// Parse failure.
    reason: String,
  },
  /// The worker id falls outside the peer set.
  #[error("worker id {worker_id} outside peer set 1..={peer_count}")]
  WorkerOutOfRange {
    /// Configured worker id.
    worker_id: PeerId,
    /// Configured peer count.
    peer_count: u32,
  },
}

/// Full configuration of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
  /// Numeric peer id used by the election.
  pub worker_id: PeerId,
  /// Human-readable node label carried in logs, entries and checkpoints.
  pub node_id: String,
  /// Size of the static peer set.
  pub peer_count: u32,
  /// Host every peer listens on.
  pub peer_host: String,
  /// Port of peer 1.
  pub base_port: u16,
  /// Address this node serves on.
  pub listen_addr: SocketAddr,
  /// Root directory for checkpoints and logs.
  pub data_dir: PathBuf,
  /// Prometheus listener, if enabled.
  pub metrics_addr: Option<SocketAddr>,
  /// Bound on one peer HTTP request.
  pub peer_request_timeout: Duration,
  /// Election timings.
  pub election: ElectionConfig,
  /// Delivery retry policy.
  pub delivery: DeliveryConfig,
  /// Operation log buffer.
  pub oplog: OpLogConfig,
  /// Periodic checkpoint schedule.
  pub checkpoint: CheckpointConfig,
  /// Sync verification schedule.
  pub sync: SyncConfig,
  /// Startup readiness policy.
  pub recovery: RecoveryConfig,
  /// Batch concurrency.
  pub batch: BatchConfig,
}

impl Default for NodeConfig {
  fn default() -> Self {
    Self::for_worker(1)
  }
}

impl NodeConfig {
  /// Defaults for peer `worker_id` of a four-node local cluster.
  pub fn for_worker(worker_id: PeerId) -> Self {
    let base_port = 5000;
    Self {
      worker_id,
      node_id: format!("node-{worker_id}"),
      peer_count: 4,
      peer_host: "localhost".to_string(),
      base_port,
      listen_addr: SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        derived_port(base_port, worker_id),
      ),
      data_dir: PathBuf::from("data"),
      metrics_addr: None,
      peer_request_timeout: Duration::from_secs(5),
      election: ElectionConfig::default(),
      delivery: DeliveryConfig::default(),
      oplog: OpLogConfig::default(),
      checkpoint: CheckpointConfig::default(),
      sync: SyncConfig::default(),
      recovery: RecoveryConfig::default(),
      batch: BatchConfig::default(),
    }
  }

  /// Reads the configuration from the process environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Reads the configuration through `lookup`, which maps a variable name to its value.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    let worker_id: PeerId = parse(&lookup, "WORKER_ID")?.unwrap_or(1);
    let mut config = Self::for_worker(worker_id);

    if let Some(node_id) = lookup("NODE_ID").filter(|s| !s.is_empty()) {
      config.node_id = node_id;
    }
    if let Some(peer_count) = parse(&lookup, "PEER_COUNT")? {
      config.peer_count = peer_count;
    }
    if let Some(host) = lookup("PEER_HOST").filter(|s| !s.is_empty()) {
      config.peer_host = host;
    }
    if let Some(base_port) = parse(&lookup, "BASE_PORT")? {
      config.base_port = base_port;
    }
    let port = parse(&lookup, "PORT")?.unwrap_or_else(|| derived_port(config.base_port, worker_id));
    config.listen_addr.set_port(port);
    if let Some(dir) = lookup("DATA_DIR").filter(|s| !s.is_empty()) {
      config.data_dir = PathBuf::from(dir);
    }
    config.metrics_addr = parse(&lookup, "METRICS_ADDR")?;

    config.validate()?;
    Ok(config)
  }

  /// Checks the worker id against the peer set.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.worker_id == 0 || self.worker_id > self.peer_count {
      return Err(ConfigError::WorkerOutOfRange {
        worker_id: self.worker_id,
        peer_count: self.peer_count,
      });
    }
    Ok(())
  }

  /// Directory holding checkpoint files.
  pub fn checkpoint_dir(&self) -> PathBuf {
    self.data_dir.join("checkpoints")
  }

  /// Directory holding operation log partitions.
  pub fn log_dir(&self) -> PathBuf {
    self.data_dir.join("logs")
  }

  /// Sets the data directory.
  #[must_use]
  pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
    self.data_dir = data_dir.into();
    self
  }

  /// Sets the listen address.
  #[must_use]
  pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
    self.listen_addr = listen_addr;
    self
  }

  /// Sets the election timings.
  #[must_use]
  pub fn with_election(mut self, election: ElectionConfig) -> Self {
    self.election = election;
    self
  }

  /// Sets the delivery retry policy.
  #[must_use]
  pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
    self.delivery = delivery;
    self
  }
}

fn derived_port(base_port: u16, worker_id: PeerId) -> u16 {
  base_port.saturating_add(worker_id.saturating_sub(1).min(u32::from(u16::MAX)) as u16)
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
  T: std::str::FromStr,
  T::Err: std::fmt::Display,
{
  match lookup(key).filter(|s| !s.trim().is_empty()) {
    None => Ok(None),
    Some(value) => value
      .trim()
      .parse()
      .map(Some)
      .map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
      }),
  }
}
