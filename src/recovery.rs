//! Crash recovery: restore the latest checkpoint, then replay newer operations.
//!
//! Recovery runs once at node startup, before the node serves traffic:
//!
//! 1. wait for the business store to be reachable ([`RecoveryHandler::ready`]);
//! 2. find the latest checkpoint; none means a fresh node;
//! 3. verify its digest; a mismatch aborts before anything is applied;
//! 4. upsert every snapshot record;
//! 5. replay every logged operation newer than the checkpoint in replay order.
//!
//! Per-record and per-operation failures are logged, counted and skipped.
//! Replaying an operation that is already applied is a success.

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::oplog::{LogStore, OpLogError, OperationLogEntry, sort_for_replay};
use crate::time::{LamportClock, LogicalTime};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of applying one restored record or replayed operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
  /// The change is already reflected in the store.
  #[error("already applied")]
  Duplicate,
  /// The change could not be applied.
  #[error("apply failed: {0}")]
  Failed(String),
}

/// Business-side hooks used during recovery.
///
/// Both apply methods must be idempotent upserts by record identity.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
  /// Checks that the backing store is reachable.
  async fn ready(&self) -> Result<(), ApplyError> {
    Ok(())
  }

  /// Upserts one record of a restored snapshot collection.
  async fn apply_restored_record(&self, collection: &str, record: &Value) -> Result<(), ApplyError>;

  /// Re-applies one logged operation.
  async fn apply_replayed_operation(&self, entry: &OperationLogEntry) -> Result<(), ApplyError>;
}

/// Recovery errors.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
  /// Checkpoint lookup or verification failed.
  #[error("checkpoint error: {0}")]
  Checkpoint(#[from] CheckpointError),

  /// The operation log could not be read.
  #[error("operation log error: {0}")]
  OperationLog(#[from] OpLogError),

  /// The backing store never became reachable.
  #[error("backing store not ready after {attempts} attempts: {reason}")]
  NotReady {
    /// Attempts made.
    attempts: u32,
    /// Last failure.
    reason: String,
  },
}

impl RecoveryError {
  /// Returns true if the checkpoint failed its integrity check.
  pub fn is_integrity_failure(&self) -> bool {
    matches!(self, RecoveryError::Checkpoint(CheckpointError::Integrity { .. }))
  }
}

/// Counters of a completed restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
  /// Restored checkpoint.
  pub checkpoint_id: String,
  /// Snapshot records upserted.
  pub restored_records: usize,
  /// Snapshot records that failed to upsert.
  pub failed_records: usize,
  /// Operations applied during replay.
  pub replayed: usize,
  /// Operations found already applied.
  pub duplicates: usize,
  /// Operations that failed and were skipped.
  pub failed: usize,
  /// Greatest logical time among replayed operations.
  pub max_logical_time: Option<LogicalTime>,
}

/// Result of [`RecoveryCoordinator::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
  /// No checkpoint exists; the node starts fresh.
  NoPriorState,
  /// A checkpoint was restored and the log replayed.
  Restored(RecoveryReport),
}

/// Startup connectivity retry policy.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
  /// Readiness checks before giving up.
  pub ready_attempts: u32,
  /// Wait after failed attempt `n` is `ready_base_delay × 2^n`.
  pub ready_base_delay: Duration,
}

impl Default for RecoveryConfig {
  fn default() -> Self {
    Self {
      ready_attempts: 5,
      ready_base_delay: Duration::from_secs(1),
    }
  }
}

/// Restores node state from checkpoint and log.
pub struct RecoveryCoordinator {
  checkpoints: Arc<CheckpointStore>,
  log_store: Arc<dyn LogStore>,
  handler: Arc<dyn RecoveryHandler>,
  clock: Arc<LamportClock>,
  config: RecoveryConfig,
}

impl RecoveryCoordinator {
  /// Creates a coordinator.
  pub fn new(
    checkpoints: Arc<CheckpointStore>,
    log_store: Arc<dyn LogStore>,
    handler: Arc<dyn RecoveryHandler>,
    clock: Arc<LamportClock>,
    config: RecoveryConfig,
  ) -> Self {
    Self {
      checkpoints,
      log_store,
      handler,
      clock,
      config,
    }
  }

  /// Polls [`RecoveryHandler::ready`] with exponential backoff.
  pub async fn wait_until_ready(&self) -> Result<(), RecoveryError> {
    let attempts = self.config.ready_attempts.max(1);
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self.handler.ready().await {
        Ok(()) => {
          debug!(attempt, "backing store ready");
          return Ok(());
        }
        Err(e) if attempt >= attempts => {
          error!(attempt, error = %e, "backing store unreachable, giving up");
          return Err(RecoveryError::NotReady {
            attempts: attempt,
            reason: e.to_string(),
          });
        }
        Err(e) => {
          let delay = self.config.ready_base_delay * 2u32.saturating_pow(attempt);
          warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "backing store not ready, retrying");
          tokio::time::sleep(delay).await;
        }
      }
    }
  }

  /// Restores the latest checkpoint and replays newer operations.
  pub async fn recover(&self) -> Result<RecoveryOutcome, RecoveryError> {
    let Some(checkpoint) = self.checkpoints.find_latest_checkpoint().await? else {
      info!("no checkpoint found, starting without prior state");
      return Ok(RecoveryOutcome::NoPriorState);
    };

    if let Err(e) = checkpoint.verify() {
      error!(id = %checkpoint.id, error = %e, "refusing to restore checkpoint");
      return Err(e.into());
    }
    info!(id = %checkpoint.id, "restoring checkpoint");

    let mut report = RecoveryReport {
      checkpoint_id: checkpoint.id.clone(),
      ..RecoveryReport::default()
    };

    for (collection, records) in &checkpoint.snapshot_payload.collections {
      for record in records {
        match self.handler.apply_restored_record(collection, record).await {
          Ok(()) | Err(ApplyError::Duplicate) => report.restored_records += 1,
          Err(e) => {
            warn!(collection = %collection, error = %e, "failed to restore record");
            report.failed_records += 1;
          }
        }
      }
    }
    self.checkpoints.remember(&checkpoint);

    let mut entries = self.log_store.entries_since(checkpoint.wall_clock_time).await?;
    sort_for_replay(&mut entries);
    info!(count = entries.len(), "replaying operations since checkpoint");

    for entry in &entries {
      match self.handler.apply_replayed_operation(entry).await {
        Ok(()) => report.replayed += 1,
        Err(ApplyError::Duplicate) => {
          debug!(id = %entry.id, "operation already applied");
          report.duplicates += 1;
        }
        Err(e) => {
          warn!(id = %entry.id, operation = %entry.operation_type, error = %e, "failed to replay operation");
          report.failed += 1;
        }
      }
      report.max_logical_time = report.max_logical_time.max(Some(entry.logical_time));
    }

    if let Some(max) = report.max_logical_time {
      self.clock.observe(max);
    }
    crate::metrics::record_recovery(report.replayed, report.duplicates, report.failed);
    info!(
      checkpoint = %report.checkpoint_id,
      restored = report.restored_records,
      replayed = report.replayed,
      duplicates = report.duplicates,
      failed = report.failed,
      "recovery completed"
    );
    Ok(RecoveryOutcome::Restored(report))
  }
}
