//! Append-only operation log used for replay after a crash.
//!
//! Every committed business mutation is recorded once through
//! [`OperationLog::append_operation`]. An entry lands in three places:
//!
//! 1. a bounded in-memory buffer (oldest entries evicted first),
//! 2. the durable [`LogStore`] (by default day-partitioned JSON lines on disk),
//! 3. every peer, when this node currently holds leadership.
//!
//! Durable writes are best-effort: a failed write is logged and counted, the
//! caller still gets its entry back.

use crate::replication::{ReplicationEvent, Replicator};
use crate::time::{LamportClock, LogicalTime, WallClock};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// File name prefix of a log partition.
const PARTITION_PREFIX: &str = "operations_";
/// File name suffix of a log partition.
const PARTITION_SUFFIX: &str = ".log";

/// One committed business operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
  /// Unique entry identifier.
  pub id: String,
  /// Wall-clock time of the append on the origin node.
  pub wall_clock_time: DateTime<Utc>,
  /// Node that committed the operation.
  pub origin_node_id: String,
  /// Lamport time of the append on the origin node.
  pub logical_time: LogicalTime,
  /// Business operation name, e.g. `attendance-marked`.
  pub operation_type: String,
  /// Operation payload.
  pub payload: Value,
}

impl OperationLogEntry {
  /// Replay order: logical time, then wall-clock time, then id.
  pub fn replay_cmp(&self, other: &Self) -> Ordering {
    self
      .logical_time
      .cmp(&other.logical_time)
      .then_with(|| self.wall_clock_time.cmp(&other.wall_clock_time))
      .then_with(|| self.id.cmp(&other.id))
  }
}

/// Sorts entries into replay order.
pub fn sort_for_replay(entries: &mut [OperationLogEntry]) {
  entries.sort_by(OperationLogEntry::replay_cmp);
}

/// Operation log errors.
#[derive(Debug, thiserror::Error)]
pub enum OpLogError {
  /// I/O error on a log partition.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// Entry could not be encoded.
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Durable storage for operation log entries.
#[async_trait]
pub trait LogStore: Send + Sync {
  /// Appends one entry.
  async fn append(&self, entry: &OperationLogEntry) -> Result<(), OpLogError>;

  /// Returns every stored entry with a wall-clock time strictly after `since`.
  ///
  /// The result is in storage order; callers sort with [`sort_for_replay`].
  async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationLogEntry>, OpLogError>;
}

/// [`LogStore`] writing one JSON entry per line into day partitions named
/// `operations_YYYY-MM-DD.log`.
pub struct FileLogStore {
  dir: PathBuf,
  write_lock: tokio::sync::Mutex<()>,
}

impl FileLogStore {
  /// Creates a store rooted at `dir`; the directory is created on first write.
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      write_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Returns the log directory.
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Returns the partition file holding entries of `day`.
  pub fn partition_path(&self, day: NaiveDate) -> PathBuf {
    self
      .dir
      .join(format!("{PARTITION_PREFIX}{}{PARTITION_SUFFIX}", day.format("%Y-%m-%d")))
  }

  fn partition_day(file_name: &str) -> Option<NaiveDate> {
    let day = file_name
      .strip_prefix(PARTITION_PREFIX)?
      .strip_suffix(PARTITION_SUFFIX)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
  }
}

#[async_trait]
impl LogStore for FileLogStore {
  async fn append(&self, entry: &OperationLogEntry) -> Result<(), OpLogError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let path = self.partition_path(entry.wall_clock_time.date_naive());

    let _guard = self.write_lock.lock().await;
    tokio::fs::create_dir_all(&self.dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
  }

  async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationLogEntry>, OpLogError> {
    let mut dir = match tokio::fs::read_dir(&self.dir).await {
      Ok(dir) => dir,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut partitions = Vec::new();
    while let Some(item) = dir.next_entry().await? {
      let name = item.file_name();
      let Some(day) = name.to_str().and_then(Self::partition_day) else {
        continue;
      };
      // Whole partitions older than the cut-off day cannot hold newer entries.
      if day < since.date_naive() {
        continue;
      }
      partitions.push((day, item.path()));
    }
    partitions.sort();

    let mut entries = Vec::new();
    for (_, path) in partitions {
      let content = tokio::fs::read_to_string(&path).await?;
      for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
          continue;
        }
        match serde_json::from_str::<OperationLogEntry>(line) {
          Ok(entry) if entry.wall_clock_time > since => entries.push(entry),
          Ok(_) => {}
          Err(e) => warn!(
            file = %path.display(),
            line = line_no + 1,
            error = %e,
            "skipping unparsable operation log line"
          ),
        }
      }
    }
    Ok(entries)
  }
}

/// [`LogStore`] kept in memory.
#[derive(Default)]
pub struct InMemoryLogStore {
  entries: Mutex<Vec<OperationLogEntry>>,
}

impl InMemoryLogStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns every stored entry.
  pub fn all(&self) -> Vec<OperationLogEntry> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
  async fn append(&self, entry: &OperationLogEntry) -> Result<(), OpLogError> {
    self
      .entries
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(entry.clone());
    Ok(())
  }

  async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationLogEntry>, OpLogError> {
    Ok(
      self
        .entries
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter(|e| e.wall_clock_time > since)
        .cloned()
        .collect(),
    )
  }
}

/// Operation log configuration.
#[derive(Debug, Clone)]
pub struct OpLogConfig {
  /// Entries kept in the in-memory buffer.
  pub buffer_capacity: usize,
}

impl Default for OpLogConfig {
  fn default() -> Self {
    Self {
      buffer_capacity: 1000,
    }
  }
}

/// The node's operation log.
pub struct OperationLog {
  node_id: String,
  clock: Arc<LamportClock>,
  wall_clock: Arc<dyn WallClock>,
  store: Arc<dyn LogStore>,
  replicator: Option<Arc<dyn Replicator>>,
  buffer: Mutex<VecDeque<OperationLogEntry>>,
  capacity: usize,
}

impl OperationLog {
  /// Creates a log for `node_id` writing to `store`.
  pub fn new(
    node_id: impl Into<String>,
    clock: Arc<LamportClock>,
    wall_clock: Arc<dyn WallClock>,
    store: Arc<dyn LogStore>,
    config: OpLogConfig,
  ) -> Self {
    let capacity = config.buffer_capacity.max(1);
    Self {
      node_id: node_id.into(),
      clock,
      wall_clock,
      store,
      replicator: None,
      buffer: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity,
    }
  }

  /// Replicates appended entries through `replicator` while leading.
  pub fn with_replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
    self.replicator = Some(replicator);
    self
  }

  /// Returns the durable store.
  pub fn store(&self) -> &Arc<dyn LogStore> {
    &self.store
  }

  fn buffer(&self) -> MutexGuard<'_, VecDeque<OperationLogEntry>> {
    self.buffer.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn push_buffered(&self, entry: OperationLogEntry) {
    let mut buffer = self.buffer();
    while buffer.len() >= self.capacity {
      buffer.pop_front();
    }
    buffer.push_back(entry);
  }

  async fn persist(&self, entry: &OperationLogEntry) {
    if let Err(e) = self.store.append(entry).await {
      warn!(id = %entry.id, operation = %entry.operation_type, error = %e, "failed to persist operation log entry");
      crate::metrics::record_persistence_failure("operation-log");
    }
  }

  /// Records a committed operation and returns the stamped entry.
  pub async fn append_operation(&self, operation_type: &str, payload: Value) -> OperationLogEntry {
    let entry = OperationLogEntry {
      id: crate::id::generate("op"),
      wall_clock_time: self.wall_clock.now(),
      origin_node_id: self.node_id.clone(),
      logical_time: self.clock.tick(),
      operation_type: operation_type.to_string(),
      payload,
    };
    debug!(id = %entry.id, operation = %operation_type, lamport = %entry.logical_time, "operation logged");

    self.push_buffered(entry.clone());
    self.persist(&entry).await;
    crate::metrics::record_operation_logged(operation_type);

    if let Some(replicator) = &self.replicator {
      match serde_json::to_value(&entry) {
        Ok(value) => {
          replicator.replicate(ReplicationEvent::Operation, value);
        }
        Err(e) => warn!(id = %entry.id, error = %e, "failed to encode operation for replication"),
      }
    }
    entry
  }

  /// Stores an entry received from the leader.
  ///
  /// The local clock observes the entry's logical time first. The entry keeps
  /// its origin stamps and is not replicated further.
  pub async fn record_replicated(&self, entry: OperationLogEntry) {
    self.clock.observe(entry.logical_time);
    self.push_buffered(entry.clone());
    self.persist(&entry).await;
  }

  /// Returns the buffered entries, oldest first.
  pub fn buffered(&self) -> Vec<OperationLogEntry> {
    self.buffer().iter().cloned().collect()
  }

  /// Returns the number of buffered entries.
  pub fn buffered_len(&self) -> usize {
    self.buffer().len()
  }

  /// Returns durable entries newer than `since`, in replay order.
  pub async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationLogEntry>, OpLogError> {
    let mut entries = self.store.entries_since(since).await?;
    sort_for_replay(&mut entries);
    Ok(entries)
  }
}
