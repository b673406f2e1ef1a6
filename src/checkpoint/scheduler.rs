//! Leader-gated periodic checkpoint creation.

use super::{CheckpointError, CheckpointKind, CheckpointStore, SnapshotPayload};
use crate::election::LeaderHandle;
use crate::schedule::RecurringTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Bounds on how much history a snapshot captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotWindow {
  /// Only records newer than this many days are captured.
  pub days: i64,
  /// At most this many records per collection.
  pub max_records: usize,
}

impl Default for SnapshotWindow {
  fn default() -> Self {
    Self {
      days: 7,
      max_records: 1000,
    }
  }
}

impl SnapshotWindow {
  /// Returns the oldest creation time a captured record may have.
  pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::days(self.days)
  }
}

/// Produces the business state captured by checkpoints.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
  /// Returns the recent history within `window`.
  async fn snapshot(&self, window: &SnapshotWindow) -> Result<SnapshotPayload, CheckpointError>;
}

/// A payload captured ahead of time snapshots as itself.
#[async_trait]
impl SnapshotSource for SnapshotPayload {
  async fn snapshot(&self, _window: &SnapshotWindow) -> Result<SnapshotPayload, CheckpointError> {
    Ok(self.clone())
  }
}

/// Periodic checkpoint configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
  /// Creation period.
  pub interval: Duration,
  /// Snapshot bounds.
  pub window: SnapshotWindow,
}

impl Default for CheckpointConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(5 * 60),
      window: SnapshotWindow::default(),
    }
  }
}

/// Starts the recurring task that checkpoints the business state.
///
/// Leadership is checked at each run, not at start: a node that gains
/// leadership later starts checkpointing on its next tick. Failures are
/// logged and the next run proceeds normally.
pub fn start_periodic_checkpoints(
  store: Arc<CheckpointStore>,
  source: Arc<dyn SnapshotSource>,
  leader: LeaderHandle,
  config: CheckpointConfig,
) -> RecurringTask {
  let window = config.window;
  RecurringTask::start("periodic-checkpoint", config.interval, move || {
    let store = Arc::clone(&store);
    let source = Arc::clone(&source);
    let leader = leader.clone();
    async move {
      if !leader.is_leader() {
        debug!("not leader, skipping periodic checkpoint");
        return;
      }
      let result = store
        .create_tagged_checkpoint(CheckpointKind::FullSystem, "periodic", source.as_ref(), &window)
        .await;
      if let Err(e) = result {
        error!(error = %e, "periodic checkpoint failed");
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::checkpoint::{CheckpointStorage, InMemoryCheckpointStorage};
  use crate::election::{ElectionState, LeaderState};
  use crate::time::SystemClock;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingSource {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl SnapshotSource for CountingSource {
    async fn snapshot(&self, window: &SnapshotWindow) -> Result<SnapshotPayload, CheckpointError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(SnapshotPayload::new().with_metadata("maxRecords", json!(window.max_records)))
    }
  }

  fn store() -> (Arc<CheckpointStore>, Arc<InMemoryCheckpointStorage>) {
    let storage = Arc::new(InMemoryCheckpointStorage::new());
    let store = Arc::new(CheckpointStore::new("node-1", Arc::new(SystemClock), storage.clone()));
    (store, storage)
  }

  #[test]
  fn test_window_since() {
    let now = DateTime::parse_from_rfc3339("2024-03-08T00:00:00Z")
      .unwrap()
      .with_timezone(&Utc);
    let since = SnapshotWindow::default().since(now);
    assert_eq!(since.to_rfc3339(), "2024-03-01T00:00:00+00:00");
  }

  #[tokio::test(start_paused = true)]
  async fn test_leader_checkpoints_every_interval() {
    let (store, storage) = store();
    let source = Arc::new(CountingSource {
      calls: AtomicUsize::new(0),
    });
    let task = start_periodic_checkpoints(
      store.clone(),
      source.clone(),
      LeaderHandle::always_leader(1),
      CheckpointConfig::default(),
    );

    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    task.stop().await;

    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    let latest = store.latest().unwrap();
    assert_eq!(latest.snapshot_payload.metadata["checkpointReason"], json!("periodic"));
    assert_eq!(latest.snapshot_payload.metadata["maxRecords"], json!(1000));
    assert!(!storage.list().await.unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_follower_never_checkpoints() {
    let (store, _storage) = store();
    let source = Arc::new(CountingSource {
      calls: AtomicUsize::new(0),
    });
    let follower = LeaderHandle::fixed(LeaderState {
      state: ElectionState::Follower,
      current_leader_id: Some(2),
      is_self_leader: false,
    });
    let task = start_periodic_checkpoints(store.clone(), source.clone(), follower, CheckpointConfig::default());

    tokio::time::sleep(Duration::from_secs(30 * 60)).await;
    task.stop().await;

    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    assert!(store.latest().is_none());
  }
}
