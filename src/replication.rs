//! Leader-to-follower replication of operations and checkpoints.
//!
//! The leader pushes every appended operation and every checkpoint to all
//! peers through the [`ReliableDeliveryQueue`]. The envelope on the wire is a
//! [`ReplicationMessage`], posted by the peer HTTP transport to
//! `/api/replicate`. Followers never fan out.

use crate::delivery::{MessageId, ReliableDeliveryQueue};
use crate::election::LeaderHandle;
use crate::time::{LamportClock, Timestamped};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Kind of replicated payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationEvent {
  /// A full checkpoint record.
  #[serde(rename = "replicate-checkpoint")]
  Checkpoint,
  /// One operation log entry.
  #[serde(rename = "replicate-operation")]
  Operation,
}

impl ReplicationEvent {
  /// Returns the wire name of the event.
  pub fn as_str(self) -> &'static str {
    match self {
      ReplicationEvent::Checkpoint => "replicate-checkpoint",
      ReplicationEvent::Operation => "replicate-operation",
    }
  }
}

impl fmt::Display for ReplicationEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Body of `POST /api/replicate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationMessage {
  /// Delivery queue id of this push.
  pub message_id: MessageId,
  /// What the payload is.
  pub event: ReplicationEvent,
  /// Sending node.
  pub origin_node_id: String,
  /// The checkpoint or operation entry, stamped with the sender's logical time.
  #[serde(flatten)]
  pub stamped: Timestamped<Value>,
}

/// Pushes replicated state to peers.
pub trait Replicator: Send + Sync {
  /// Sends `payload` to every peer if this node leads.
  ///
  /// Returns the number of queued pushes; zero on a follower.
  fn replicate(&self, event: ReplicationEvent, payload: Value) -> usize;

  /// Sends `payload` to one peer, whatever the leadership.
  fn send_to(&self, destination: &str, event: ReplicationEvent, payload: Value) -> Option<MessageId>;
}

/// [`Replicator`] that fans out to a fixed list of peer addresses, gated on
/// the node's leadership.
pub struct LeaderFanout {
  node_id: String,
  leader: LeaderHandle,
  clock: Arc<LamportClock>,
  queue: ReliableDeliveryQueue,
  peers: Vec<String>,
}

impl LeaderFanout {
  /// Creates a fan-out over `peers` (base URLs of every other node).
  pub fn new(
    node_id: impl Into<String>,
    leader: LeaderHandle,
    clock: Arc<LamportClock>,
    queue: ReliableDeliveryQueue,
    peers: Vec<String>,
  ) -> Self {
    Self {
      node_id: node_id.into(),
      leader,
      clock,
      queue,
      peers,
    }
  }

  /// Returns the peer addresses.
  pub fn peers(&self) -> &[String] {
    &self.peers
  }
}

impl Replicator for LeaderFanout {
  fn replicate(&self, event: ReplicationEvent, payload: Value) -> usize {
    if !self.leader.is_leader() || self.peers.is_empty() {
      return 0;
    }
    let stamped = self.clock.stamp(payload);
    let mut queued = 0;
    for peer in &self.peers {
      if self.enqueue(peer, event, stamped.clone()).is_some() {
        queued += 1;
      }
    }
    debug!(event = %event, peers = queued, lamport = %stamped.logical_time, "replicating to peers");
    queued
  }

  fn send_to(&self, destination: &str, event: ReplicationEvent, payload: Value) -> Option<MessageId> {
    self.enqueue(destination, event, self.clock.stamp(payload))
  }
}

impl LeaderFanout {
  fn enqueue(
    &self,
    destination: &str,
    event: ReplicationEvent,
    stamped: Timestamped<Value>,
  ) -> Option<MessageId> {
    let message_id = crate::id::generate("repl");
    let message = ReplicationMessage {
      message_id: message_id.clone(),
      event,
      origin_node_id: self.node_id.clone(),
      stamped,
    };
    match serde_json::to_value(&message) {
      Ok(body) => Some(self.queue.send(destination, event.as_str(), body, Some(message_id))),
      Err(e) => {
        warn!(event = %event, error = %e, "failed to encode replication message");
        None
      }
    }
  }
}
