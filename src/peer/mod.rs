//! Peer wire surface: the HTTP/1.1 JSON endpoints nodes use to reach each other.
//!
//! | Method | Path                   | Body                     | Answer             |
//! |--------|------------------------|--------------------------|--------------------|
//! | GET    | `/health`              |                          | [`HealthStatus`]   |
//! | POST   | `/api/leader/stepdown` | [`StepDownRequest`]      | [`StepDownAnswer`] |
//! | POST   | `/api/replicate`       | `ReplicationMessage`     | [`ReplicateAnswer`]|
//! | GET    | `/api/sync`            |                          | [`SyncDigest`]     |
//! | GET    | `/system-info`         |                          | [`SystemInfo`]     |
//!
//! [`PeerServer`] serves them on top of a [`PeerHandler`]; [`HttpPeerClient`]
//! is the matching client and doubles as the election probe transport and the
//! replication delivery transport.

mod client;
mod server;

#[cfg(test)]
mod http_test;

pub use client::HttpPeerClient;
pub use server::{DEFAULT_BODY_LIMIT, PeerHandler, PeerServer};

use crate::election::PeerId;
use crate::time::LogicalTime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health path.
pub const HEALTH_PATH: &str = "/health";
/// Step-down path.
pub const STEP_DOWN_PATH: &str = "/api/leader/stepdown";
/// Replication path.
pub const REPLICATE_PATH: &str = "/api/replicate";
/// Sync digest path.
pub const SYNC_PATH: &str = "/api/sync";
/// System info path.
pub const SYSTEM_INFO_PATH: &str = "/system-info";

/// Peer transport errors.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
  /// The peer address could not be parsed.
  #[error("invalid peer address: {0}")]
  InvalidAddress(String),
  /// TCP connect failed.
  #[error("connect to {addr} failed: {reason}")]
  Connect {
    /// Target address.
    addr: String,
    /// OS error.
    reason: String,
  },
  /// HTTP protocol error.
  #[error("http error: {0}")]
  Http(String),
  /// The peer answered with a non-success status.
  #[error("peer answered {0}")]
  Status(u16),
  /// The request did not complete in time.
  #[error("request timed out")]
  Timeout,
  /// A body could not be encoded or decoded.
  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
  /// The listener could not be bound.
  #[error("bind failed: {0}")]
  Bind(#[from] std::io::Error),
  /// The local handler rejected a request.
  #[error("{0}")]
  Rejected(String),
  /// A request body exceeded the server's limit.
  #[error("request body exceeds {limit} bytes")]
  BodyTooLarge {
    /// Configured limit in bytes.
    limit: usize,
  },
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
  /// `"ok"` when the node is serving.
  pub status: String,
  /// Node label.
  pub node_id: String,
  /// Numeric peer id.
  pub worker_id: PeerId,
  /// Whether the node currently leads.
  pub is_leader: bool,
  /// Current logical time.
  pub logical_time: LogicalTime,
  /// Wall-clock time of the answer.
  pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
  /// Returns true if the node reports itself healthy.
  pub fn is_ok(&self) -> bool {
    self.status == "ok"
  }
}

/// Body of `POST /api/leader/stepdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDownRequest {
  /// Id of the node claiming leadership.
  pub claimant_id: PeerId,
}

/// Answer to a step-down directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDownAnswer {
  /// Whether the claimant was accepted.
  pub accepted: bool,
  /// Whether this node still leads.
  pub is_leader: bool,
}

/// Answer to a replication push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateAnswer {
  /// Echo of the pushed message id.
  pub message_id: String,
  /// Always true on a 200 answer.
  pub acknowledged: bool,
}

/// Body of `GET /api/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDigest {
  /// Node label.
  pub node_id: String,
  /// Latest checkpoint known to the node.
  pub latest_checkpoint_id: Option<String>,
  /// Integrity digest of that checkpoint.
  pub digest: Option<String>,
  /// Creation time of that checkpoint.
  #[serde(default)]
  pub latest_checkpoint_time: Option<DateTime<Utc>>,
}

/// Body of `GET /system-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
  /// Node label.
  pub node_id: String,
  /// Numeric peer id.
  pub worker_id: PeerId,
  /// Whether the node currently leads.
  pub is_leader: bool,
  /// Known leader.
  pub current_leader_id: Option<PeerId>,
  /// Latest checkpoint id.
  pub last_checkpoint_id: Option<String>,
  /// Operations in the in-memory log buffer.
  pub buffered_operations: usize,
  /// Messages awaiting acknowledgment.
  pub pending_messages: usize,
  /// Size of the peer set.
  pub peer_count: u32,
  /// Current logical time.
  pub logical_time: LogicalTime,
}
