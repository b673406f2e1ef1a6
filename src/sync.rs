//! Leader-side sync verification.
//!
//! The leader periodically asks each follower for the digest of its latest
//! checkpoint and re-sends its own latest checkpoint to every follower whose
//! digest differs, unless the follower's checkpoint is the newer one.
//! Unreachable followers are skipped until the next pass.

use crate::checkpoint::CheckpointStore;
use crate::election::LeaderHandle;
use crate::peer::{HttpPeerClient, PeerError, SyncDigest};
use crate::replication::{ReplicationEvent, Replicator};
use crate::schedule::RecurringTask;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fetches a peer's sync digest.
#[async_trait]
pub trait DigestProbe: Send + Sync {
  /// Returns the digest reported by the peer at `address`.
  async fn fetch_digest(&self, address: &str) -> Result<SyncDigest, PeerError>;
}

#[async_trait]
impl DigestProbe for HttpPeerClient {
  async fn fetch_digest(&self, address: &str) -> Result<SyncDigest, PeerError> {
    self.sync_digest(address).await
  }
}

/// Sync verification period.
#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Time between passes.
  pub interval: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(10 * 60),
    }
  }
}

/// Per-peer counts of one verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Peers already holding the leader's latest checkpoint.
  pub in_sync: usize,
  /// Peers that were sent the latest checkpoint again.
  pub resent: usize,
  /// Peers holding a checkpoint newer than the leader's.
  pub ahead: usize,
  /// Peers that did not answer.
  pub unreachable: usize,
}

/// Compares follower digests with the leader's latest checkpoint.
pub struct SyncVerifier {
  checkpoints: Arc<CheckpointStore>,
  probe: Arc<dyn DigestProbe>,
  replicator: Arc<dyn Replicator>,
  leader: LeaderHandle,
  peers: Vec<String>,
}

impl SyncVerifier {
  /// Creates a verifier over the follower base addresses in `peers`.
  pub fn new(
    checkpoints: Arc<CheckpointStore>,
    probe: Arc<dyn DigestProbe>,
    replicator: Arc<dyn Replicator>,
    leader: LeaderHandle,
    peers: Vec<String>,
  ) -> Self {
    Self {
      checkpoints,
      probe,
      replicator,
      leader,
      peers,
    }
  }

  /// Runs one pass. Followers and nodes without a checkpoint do nothing.
  pub async fn verify_once(&self) -> SyncReport {
    let mut report = SyncReport::default();
    if !self.leader.is_leader() {
      return report;
    }
    let Some(latest) = self.checkpoints.latest() else {
      debug!("no checkpoint yet, skipping sync verification");
      return report;
    };

    let answers = futures::future::join_all(
      self
        .peers
        .iter()
        .map(|peer| async move { (peer, self.probe.fetch_digest(peer).await) }),
    )
    .await;

    for (peer, answer) in answers {
      match answer {
        Ok(digest) if digest.digest.as_deref() == Some(latest.integrity_digest.as_str()) => {
          report.in_sync += 1;
        }
        Ok(digest)
          if digest
            .latest_checkpoint_time
            .is_some_and(|theirs| theirs > latest.wall_clock_time) =>
        {
          debug!(
            peer = %peer,
            theirs = ?digest.latest_checkpoint_id,
            ours = %latest.id,
            "follower holds a newer checkpoint"
          );
          report.ahead += 1;
        }
        Ok(digest) => {
          info!(
            peer = %peer,
            theirs = ?digest.latest_checkpoint_id,
            ours = %latest.id,
            "follower out of sync, re-sending latest checkpoint"
          );
          match serde_json::to_value(&latest) {
            Ok(value) => {
              self
                .replicator
                .send_to(peer, ReplicationEvent::Checkpoint, value);
              report.resent += 1;
            }
            Err(e) => warn!(error = %e, "failed to encode checkpoint for re-send"),
          }
        }
        Err(e) => {
          debug!(peer = %peer, error = %e, "sync digest unavailable");
          report.unreachable += 1;
        }
      }
    }
    crate::metrics::record_sync_verification(
      report.in_sync,
      report.resent,
      report.ahead,
      report.unreachable,
    );
    report
  }

  /// Starts the recurring verification task.
  pub fn start(self: Arc<Self>, config: SyncConfig) -> RecurringTask {
    RecurringTask::start("sync-verification", config.interval, move || {
      let verifier = Arc::clone(&self);
      async move {
        verifier.verify_once().await;
      }
    })
  }
}
