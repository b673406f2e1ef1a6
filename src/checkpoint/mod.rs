//! Integrity-checked state snapshots.
//!
//! A [`Checkpoint`] is a full snapshot of the business layer's recent history
//! plus a SHA-256 digest of its canonical JSON encoding. Checkpoints are
//! immutable once written; each one is stored as `<type>_<millis>.json` under
//! the checkpoint directory. Recovery restores the latest one and replays the
//! operation log from its creation time onwards.
//!
//! Periodic creation is leader-gated and lives in [`scheduler`].

mod scheduler;

pub use scheduler::{
  CheckpointConfig, SnapshotSource, SnapshotWindow, start_periodic_checkpoints,
};

use crate::oplog::OperationLog;
use crate::replication::{ReplicationEvent, Replicator};
use crate::time::WallClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Error type for checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Checkpoint not found.
  #[error("checkpoint not found: {0}")]
  NotFound(String),
  /// The stored digest does not match the payload.
  #[error("checkpoint {id} failed integrity check: expected {expected}, computed {actual}")]
  Integrity {
    /// Checkpoint id.
    id: String,
    /// Digest stored with the checkpoint.
    expected: String,
    /// Digest of the payload as read.
    actual: String,
  },
  /// The snapshot source could not produce a payload.
  #[error("snapshot error: {0}")]
  Snapshot(String),
}

/// Why a checkpoint was taken.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
  /// Regular snapshot of every collection.
  FullSystem,
  /// Snapshot taken on a shutdown or crash path.
  Emergency,
}

impl CheckpointKind {
  /// Returns the name used in ids and file names.
  pub fn as_str(self) -> &'static str {
    match self {
      CheckpointKind::FullSystem => "full-system",
      CheckpointKind::Emergency => "emergency",
    }
  }
}

impl fmt::Display for CheckpointKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CheckpointKind {
  type Err = CheckpointError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "full-system" => Ok(CheckpointKind::FullSystem),
      "emergency" => Ok(CheckpointKind::Emergency),
      other => Err(CheckpointError::NotFound(format!("unknown checkpoint type {other}"))),
    }
  }
}

/// Business state captured by a checkpoint.
///
/// Both maps are ordered, so the JSON encoding (and thus the digest) does not
/// depend on insertion order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
  /// Records per collection name.
  pub collections: BTreeMap<String, Vec<Value>>,
  /// Free-form metadata (counts, reason, node).
  pub metadata: BTreeMap<String, Value>,
}

impl SnapshotPayload {
  /// Creates an empty payload.
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a collection.
  #[must_use]
  pub fn with_collection(mut self, name: impl Into<String>, records: Vec<Value>) -> Self {
    self.collections.insert(name.into(), records);
    self
  }

  /// Adds a metadata entry.
  #[must_use]
  pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
    self.metadata.insert(key.into(), value);
    self
  }

  /// Returns the total number of records across collections.
  pub fn record_count(&self) -> usize {
    self.collections.values().map(Vec::len).sum()
  }

  /// Returns the hex SHA-256 digest of the canonical JSON encoding.
  pub fn digest(&self) -> Result<String, CheckpointError> {
    let encoded = serde_json::to_vec(self)?;
    let hash = Sha256::digest(&encoded);
    Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
  }
}

/// An immutable, integrity-checked snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
  /// `<type>_<unix millis>`.
  pub id: String,
  /// Why it was taken.
  #[serde(rename = "type")]
  pub kind: CheckpointKind,
  /// Creation time on the origin node.
  pub wall_clock_time: DateTime<Utc>,
  /// Node that took it.
  pub origin_node_id: String,
  /// The captured state.
  pub snapshot_payload: SnapshotPayload,
  /// Operations buffered by the origin log at creation.
  pub operation_count_at_snapshot: u64,
  /// Hex SHA-256 of `snapshot_payload`.
  pub integrity_digest: String,
}

impl Checkpoint {
  /// Builds a checkpoint and computes its digest.
  pub fn new(
    kind: CheckpointKind,
    wall_clock_time: DateTime<Utc>,
    origin_node_id: impl Into<String>,
    snapshot_payload: SnapshotPayload,
    operation_count_at_snapshot: u64,
  ) -> Result<Self, CheckpointError> {
    let integrity_digest = snapshot_payload.digest()?;
    Ok(Self {
      id: format!("{}_{}", kind.as_str(), wall_clock_time.timestamp_millis()),
      kind,
      wall_clock_time,
      origin_node_id: origin_node_id.into(),
      snapshot_payload,
      operation_count_at_snapshot,
      integrity_digest,
    })
  }

  /// Recomputes the digest and compares it with the stored one.
  pub fn verify(&self) -> Result<(), CheckpointError> {
    let actual = self.snapshot_payload.digest()?;
    if actual == self.integrity_digest {
      Ok(())
    } else {
      Err(CheckpointError::Integrity {
        id: self.id.clone(),
        expected: self.integrity_digest.clone(),
        actual,
      })
    }
  }
}

/// Trait for checkpoint storage backends.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
  /// Persists a checkpoint; an existing one with the same id is replaced.
  async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

  /// Loads a checkpoint by id.
  async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError>;

  /// Loads every readable checkpoint.
  async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError>;

  /// Returns the checkpoint with the latest creation time.
  async fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
    Ok(
      self
        .list()
        .await?
        .into_iter()
        .max_by(|a, b| a.wall_clock_time.cmp(&b.wall_clock_time).then_with(|| a.id.cmp(&b.id))),
    )
  }
}

/// File-based checkpoint storage.
///
/// Each checkpoint is a pretty-printed JSON file `<base>/<id>.json`.
pub struct FileCheckpointStorage {
  base_path: PathBuf,
}

impl FileCheckpointStorage {
  /// Creates a new file checkpoint storage at the given path.
  pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
    }
  }

  /// Returns the file a checkpoint is stored in.
  pub fn checkpoint_path(&self, id: &str) -> PathBuf {
    let safe_name = id.replace(|c: char| !c.is_alphanumeric() && c != '_' && c != '-', "_");
    self.base_path.join(format!("{safe_name}.json"))
  }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStorage {
  async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    tokio::fs::create_dir_all(&self.base_path).await?;
    let json = serde_json::to_vec_pretty(checkpoint)?;
    tokio::fs::write(self.checkpoint_path(&checkpoint.id), json).await?;
    Ok(())
  }

  async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
    let path = self.checkpoint_path(id);
    let json = match tokio::fs::read(&path).await {
      Ok(json) => json,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        return Err(CheckpointError::NotFound(id.to_string()));
      }
      Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&json)?)
  }

  async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
    let mut dir = match tokio::fs::read_dir(&self.base_path).await {
      Ok(dir) => dir,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };
    let mut checkpoints = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
      let path = entry.path();
      if path.extension().is_none_or(|e| e != "json") {
        continue;
      }
      let parsed = tokio::fs::read(&path)
        .await
        .map_err(CheckpointError::from)
        .and_then(|json| serde_json::from_slice::<Checkpoint>(&json).map_err(CheckpointError::from));
      match parsed {
        Ok(checkpoint) => checkpoints.push(checkpoint),
        Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable checkpoint file"),
      }
    }
    checkpoints.sort_by_key(|c| c.wall_clock_time);
    Ok(checkpoints)
  }
}

/// Checkpoint storage kept in memory.
#[derive(Default)]
pub struct InMemoryCheckpointStorage {
  checkpoints: tokio::sync::Mutex<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStorage {
  /// Creates an empty storage.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
  async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let mut checkpoints = self.checkpoints.lock().await;
    checkpoints.insert(checkpoint.id.clone(), checkpoint.clone());
    Ok(())
  }

  async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
    let checkpoints = self.checkpoints.lock().await;
    checkpoints
      .get(id)
      .cloned()
      .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
  }

  async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
    let checkpoints = self.checkpoints.lock().await;
    let mut all: Vec<Checkpoint> = checkpoints.values().cloned().collect();
    all.sort_by_key(|c| c.wall_clock_time);
    Ok(all)
  }
}

/// Creates, persists and replicates checkpoints for one node.
pub struct CheckpointStore {
  node_id: String,
  wall_clock: Arc<dyn WallClock>,
  storage: Arc<dyn CheckpointStorage>,
  replicator: Option<Arc<dyn Replicator>>,
  operation_log: Option<Arc<OperationLog>>,
  latest: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore {
  /// Creates a store for `node_id` over `storage`.
  pub fn new(
    node_id: impl Into<String>,
    wall_clock: Arc<dyn WallClock>,
    storage: Arc<dyn CheckpointStorage>,
  ) -> Self {
    Self {
      node_id: node_id.into(),
      wall_clock,
      storage,
      replicator: None,
      operation_log: None,
      latest: Mutex::new(None),
    }
  }

  /// Fans new checkpoints out through `replicator` while leading.
  pub fn with_replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
    self.replicator = Some(replicator);
    self
  }

  /// Records the log's buffered operation count in new checkpoints.
  pub fn with_operation_log(mut self, log: Arc<OperationLog>) -> Self {
    self.operation_log = Some(log);
    self
  }

  /// Returns the storage backend.
  pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
    &self.storage
  }

  /// Returns the last checkpoint written, received or restored by this node.
  pub fn latest(&self) -> Option<Checkpoint> {
    self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Moves the "latest" pointer to `checkpoint` unless it is older.
  pub fn remember(&self, checkpoint: &Checkpoint) {
    let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
    let newer = latest
      .as_ref()
      .is_none_or(|current| checkpoint.wall_clock_time >= current.wall_clock_time);
    if newer {
      *latest = Some(checkpoint.clone());
    }
  }

  /// Snapshots `source`, persists the result and, on the leader, replicates it.
  ///
  /// The checkpoint time is cut before the snapshot is read. Anything
  /// committed while the snapshot runs is stamped after the cut and replays on
  /// recovery.
  pub async fn create_checkpoint(
    &self,
    kind: CheckpointKind,
    source: &dyn SnapshotSource,
    window: &SnapshotWindow,
  ) -> Result<Checkpoint, CheckpointError> {
    self.capture(kind, None, source, window).await
  }

  /// Like [`Self::create_checkpoint`], recording `reason` as `checkpointReason`.
  pub async fn create_tagged_checkpoint(
    &self,
    kind: CheckpointKind,
    reason: &str,
    source: &dyn SnapshotSource,
    window: &SnapshotWindow,
  ) -> Result<Checkpoint, CheckpointError> {
    self.capture(kind, Some(reason), source, window).await
  }

  /// Takes an [`CheckpointKind::Emergency`] checkpoint tagged with `reason`.
  pub async fn create_emergency_checkpoint(
    &self,
    reason: &str,
    source: &dyn SnapshotSource,
    window: &SnapshotWindow,
  ) -> Result<Checkpoint, CheckpointError> {
    warn!(reason = %reason, "creating emergency checkpoint");
    self
      .capture(CheckpointKind::Emergency, Some(reason), source, window)
      .await
  }

  async fn capture(
    &self,
    kind: CheckpointKind,
    reason: Option<&str>,
    source: &dyn SnapshotSource,
    window: &SnapshotWindow,
  ) -> Result<Checkpoint, CheckpointError> {
    let cut = self.wall_clock.now();
    let operation_count = self
      .operation_log
      .as_ref()
      .map_or(0, |log| log.buffered_len() as u64);
    let mut payload = source.snapshot(window).await?;
    if let Some(reason) = reason {
      payload = payload.with_metadata("checkpointReason", Value::String(reason.to_string()));
    }
    let checkpoint = Checkpoint::new(kind, cut, self.node_id.clone(), payload, operation_count)?;

    if let Err(e) = self.storage.save(&checkpoint).await {
      crate::metrics::record_persistence_failure("checkpoint");
      return Err(e);
    }
    self.remember(&checkpoint);
    crate::metrics::record_checkpoint_created(kind.as_str());
    info!(
      id = %checkpoint.id,
      records = checkpoint.snapshot_payload.record_count(),
      operations = operation_count,
      "checkpoint created"
    );

    if let Some(replicator) = &self.replicator {
      let value = serde_json::to_value(&checkpoint)?;
      replicator.replicate(ReplicationEvent::Checkpoint, value);
    }
    Ok(checkpoint)
  }

  /// Stores a checkpoint replicated from the leader after verifying it.
  pub async fn accept_replicated(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
    checkpoint.verify()?;
    self.storage.save(&checkpoint).await?;
    self.remember(&checkpoint);
    info!(id = %checkpoint.id, origin = %checkpoint.origin_node_id, "replicated checkpoint stored");
    Ok(())
  }

  /// Returns the persisted checkpoint with the latest creation time.
  pub async fn find_latest_checkpoint(&self) -> Result<Option<Checkpoint>, CheckpointError> {
    self.storage.latest().await
  }
}
