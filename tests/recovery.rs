use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rollcall::checkpoint::{
  CheckpointError, CheckpointKind, CheckpointStorage, CheckpointStore, FileCheckpointStorage,
  SnapshotPayload, SnapshotSource, SnapshotWindow,
};
use rollcall::oplog::{FileLogStore, LogStore, OpLogConfig, OperationLog};
use rollcall::recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryError, RecoveryOutcome};
use rollcall::store::RecordStore;
use rollcall::time::{LamportClock, LogicalTime, ManualClock};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// One node's worth of persistent state rooted in a temp dir.
struct Site {
  dir: TempDir,
  wall_clock: Arc<ManualClock>,
}

impl Site {
  fn new() -> Self {
    Self {
      dir: TempDir::new().unwrap(),
      wall_clock: Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap(),
      )),
    }
  }

  fn log_store(&self) -> Arc<FileLogStore> {
    Arc::new(FileLogStore::new(self.dir.path().join("logs")))
  }

  fn checkpoint_storage(&self) -> Arc<FileCheckpointStorage> {
    Arc::new(FileCheckpointStorage::new(self.dir.path().join("checkpoints")))
  }

  fn checkpoints(&self) -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(
      "node-1",
      self.wall_clock.clone(),
      self.checkpoint_storage(),
    ))
  }

  fn operation_log(&self, clock: Arc<LamportClock>) -> OperationLog {
    OperationLog::new(
      "node-1",
      clock,
      self.wall_clock.clone(),
      self.log_store(),
      OpLogConfig::default(),
    )
  }

  fn coordinator(&self, store: Arc<RecordStore>, clock: Arc<LamportClock>) -> RecoveryCoordinator {
    let log_store: Arc<dyn LogStore> = self.log_store();
    RecoveryCoordinator::new(self.checkpoints(), log_store, store, clock, RecoveryConfig::default())
  }

  fn tick(&self) {
    self.wall_clock.advance(ChronoDuration::seconds(30));
  }
}

fn student(id: &str, name: &str, attendance: u32) -> Value {
  json!({ "_id": id, "name": name, "attended": attendance })
}

// Commits two students, checkpoints, then keeps mutating.
async fn run_workload(site: &Site, store: &RecordStore, clock: Arc<LamportClock>) -> String {
  let log = site.operation_log(clock);
  let checkpoints = site.checkpoints();

  store
    .commit(&log, "student-created", "students", student("s1", "Asha", 10))
    .await
    .unwrap();
  site.tick();
  store
    .commit(&log, "student-created", "students", student("s2", "Bilal", 8))
    .await
    .unwrap();
  site.tick();

  let checkpoint = checkpoints
    .create_checkpoint(CheckpointKind::FullSystem, store, &SnapshotWindow::default())
    .await
    .unwrap();
  site.tick();

  store
    .commit(&log, "attendance-marked", "students", student("s1", "Asha", 11))
    .await
    .unwrap();
  site.tick();
  store
    .commit(&log, "student-created", "students", student("s3", "Chen", 1))
    .await
    .unwrap();
  site.tick();
  store.commit_delete(&log, "student-deleted", "students", "s2").await;
  site.tick();
  store
    .commit(&log, "grievance-filed", "grievances", json!({"_id": "g1", "status": "open"}))
    .await
    .unwrap();

  checkpoint.id
}

#[tokio::test]
async fn test_restore_then_replay_matches_uninterrupted_run() {
  let site = Site::new();
  let original = RecordStore::new(site.wall_clock.clone());
  let original_clock = Arc::new(LamportClock::new());
  let checkpoint_id = run_workload(&site, &original, original_clock.clone()).await;

  let restarted = Arc::new(RecordStore::new(site.wall_clock.clone()));
  let clock = Arc::new(LamportClock::new());
  let outcome = site
    .coordinator(restarted.clone(), clock.clone())
    .recover()
    .await
    .unwrap();

  let RecoveryOutcome::Restored(report) = outcome else {
    panic!("expected a restore, got {outcome:?}");
  };
  assert_eq!(report.checkpoint_id, checkpoint_id);
  assert_eq!(report.restored_records, 2);
  assert_eq!(report.replayed, 4);
  assert_eq!(report.failed, 0);
  assert_eq!(report.max_logical_time, Some(original_clock.current()));

  assert_eq!(restarted.dump(), original.dump());
  assert_eq!(restarted.get("students", "s1").unwrap()["attended"], 11);
  assert!(restarted.get("students", "s2").is_none());
  assert!(clock.current() > original_clock.current());
}

#[tokio::test]
async fn test_corrupted_checkpoint_restores_nothing() {
  let site = Site::new();
  let original = RecordStore::new(site.wall_clock.clone());
  let checkpoint_id = run_workload(&site, &original, Arc::new(LamportClock::new())).await;

  let path = site.checkpoint_storage().checkpoint_path(&checkpoint_id);
  let mut on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
  on_disk["snapshotPayload"]["collections"]["students"][0]["attended"] = json!(99);
  std::fs::write(&path, serde_json::to_vec_pretty(&on_disk).unwrap()).unwrap();

  let restarted = Arc::new(RecordStore::new(site.wall_clock.clone()));
  let clock = Arc::new(LamportClock::new());
  let error = site
    .coordinator(restarted.clone(), clock.clone())
    .recover()
    .await
    .unwrap_err();

  assert!(error.is_integrity_failure(), "unexpected error: {error}");
  assert!(restarted.is_empty());
  assert_eq!(clock.current(), LogicalTime::new(0));
}

#[tokio::test]
async fn test_fresh_node_has_no_prior_state() {
  let site = Site::new();
  let log = site.operation_log(Arc::new(LamportClock::new()));
  log
    .append_operation(
      "student-created",
      json!({"collection": "students", "record": student("s1", "Asha", 1)}),
    )
    .await;

  let restarted = Arc::new(RecordStore::new(site.wall_clock.clone()));
  let outcome = site
    .coordinator(restarted.clone(), Arc::new(LamportClock::new()))
    .recover()
    .await
    .unwrap();
  assert_eq!(outcome, RecoveryOutcome::NoPriorState);
  assert!(restarted.is_empty());
}

#[tokio::test]
async fn test_replay_into_current_state_counts_duplicates() {
  let site = Site::new();
  let store = Arc::new(RecordStore::new(site.wall_clock.clone()));
  run_workload(&site, &store, Arc::new(LamportClock::new())).await;
  let before = store.dump();

  let outcome = site
    .coordinator(store.clone(), Arc::new(LamportClock::new()))
    .recover()
    .await
    .unwrap();
  let RecoveryOutcome::Restored(report) = outcome else {
    panic!("expected a restore");
  };
  // The restore rolls s1 back and revives s2; replay moves both forward again.
  assert_eq!(report.replayed, 2);
  assert_eq!(report.duplicates, 2);
  assert_eq!(store.dump(), before);
}

#[tokio::test]
async fn test_latest_checkpoint_wins() {
  let site = Site::new();
  let store = RecordStore::new(site.wall_clock.clone());
  let checkpoints = site.checkpoints();

  store.upsert("students", student("s1", "Asha", 1)).unwrap();
  let first = checkpoints
    .create_checkpoint(CheckpointKind::FullSystem, &store, &SnapshotWindow::default())
    .await
    .unwrap();
  site.tick();
  store.upsert("students", student("s2", "Bilal", 1)).unwrap();
  let second = checkpoints
    .create_emergency_checkpoint("test", &store, &SnapshotWindow::default())
    .await
    .unwrap();

  let ids: Vec<String> = site
    .checkpoint_storage()
    .list()
    .await
    .unwrap()
    .into_iter()
    .map(|c| c.id)
    .collect();
  assert!(ids.contains(&first.id) && ids.contains(&second.id));
  let latest = site.checkpoints().find_latest_checkpoint().await.unwrap().unwrap();
  assert_eq!(latest.id, second.id);
  assert_eq!(latest.snapshot_payload.metadata["checkpointReason"], "test");
}

// Reads the snapshot, then lets one more commit land before handing it back.
struct CommitDuringSnapshot {
  store: Arc<RecordStore>,
  log: OperationLog,
  wall_clock: Arc<ManualClock>,
}

#[async_trait]
impl SnapshotSource for CommitDuringSnapshot {
  async fn snapshot(&self, window: &SnapshotWindow) -> Result<SnapshotPayload, CheckpointError> {
    let payload = self.store.snapshot(window).await?;
    self.wall_clock.advance(ChronoDuration::milliseconds(1));
    self
      .store
      .commit(&self.log, "student-created", "students", student("s2", "Bilal", 8))
      .await
      .unwrap();
    self.wall_clock.advance(ChronoDuration::milliseconds(1));
    Ok(payload)
  }
}

#[tokio::test]
async fn test_commit_during_snapshot_replays_after_restore() {
  let site = Site::new();
  let original = Arc::new(RecordStore::new(site.wall_clock.clone()));
  let log = site.operation_log(Arc::new(LamportClock::new()));
  original
    .commit(&log, "student-created", "students", student("s1", "Asha", 10))
    .await
    .unwrap();
  site.tick();

  let source = CommitDuringSnapshot {
    store: original.clone(),
    log,
    wall_clock: site.wall_clock.clone(),
  };
  let checkpoint = site
    .checkpoints()
    .create_checkpoint(CheckpointKind::FullSystem, &source, &SnapshotWindow::default())
    .await
    .unwrap();
  assert_eq!(checkpoint.snapshot_payload.record_count(), 1);

  let restarted = Arc::new(RecordStore::new(site.wall_clock.clone()));
  let outcome = site
    .coordinator(restarted.clone(), Arc::new(LamportClock::new()))
    .recover()
    .await
    .unwrap();
  let RecoveryOutcome::Restored(report) = outcome else {
    panic!("expected a restore, got {outcome:?}");
  };
  assert_eq!(report.restored_records, 1);
  assert_eq!(report.replayed, 1);
  assert_eq!(restarted.dump(), original.dump());
  assert!(restarted.get("students", "s2").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_gives_up_after_configured_attempts() {
  let site = Site::new();
  let store = Arc::new(RecordStore::new(site.wall_clock.clone()));
  store.set_available(false);
  let log_store: Arc<dyn LogStore> = site.log_store();
  let coordinator = RecoveryCoordinator::new(
    site.checkpoints(),
    log_store,
    store,
    Arc::new(LamportClock::new()),
    RecoveryConfig {
      ready_attempts: 3,
      ready_base_delay: Duration::from_secs(1),
    },
  );

  let started = tokio::time::Instant::now();
  let error = coordinator.wait_until_ready().await.unwrap_err();
  assert!(matches!(error, RecoveryError::NotReady { attempts: 3, .. }));
  // 2s after the first failure, 4s after the second.
  assert_eq!(started.elapsed(), Duration::from_secs(6));
}
