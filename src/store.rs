//! In-memory record store with upsert-by-identity semantics.
//!
//! Stands in for the business database in the node binary and in tests. It
//! implements the hooks the coordination core consumes: [`RecoveryHandler`]
//! for restore and replay, and [`SnapshotSource`] for periodic checkpoints.
//!
//! Records are JSON objects identified by their `_id` string. Operations carry
//! a `{collection, record}` payload (upserts) or a `{collection, id}` payload
//! for operation types ending in `-deleted`. A replayed operation whose effect
//! is already present (same record, or record already gone) is a duplicate.

use crate::checkpoint::{CheckpointError, SnapshotPayload, SnapshotSource, SnapshotWindow};
use crate::oplog::{OperationLog, OperationLogEntry};
use crate::recovery::{ApplyError, RecoveryHandler};
use crate::time::WallClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Field holding a record's identity.
pub const ID_FIELD: &str = "_id";
/// Field holding a record's creation time (RFC 3339), used by snapshot windows.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The record is not an object with a string `_id`.
  #[error("record in {collection} has no string _id")]
  MissingIdentity {
    /// Target collection.
    collection: String,
  },
  /// An operation payload lacks the expected fields.
  #[error("malformed operation payload: {0}")]
  MalformedOperation(String),
  /// The store is marked unavailable.
  #[error("store unavailable")]
  Unavailable,
}

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

/// The in-memory business store.
pub struct RecordStore {
  wall_clock: Arc<dyn WallClock>,
  collections: RwLock<Collections>,
  available: AtomicBool,
}

impl RecordStore {
  /// Creates an empty, available store.
  pub fn new(wall_clock: Arc<dyn WallClock>) -> Self {
    Self {
      wall_clock,
      collections: RwLock::new(BTreeMap::new()),
      available: AtomicBool::new(true),
    }
  }

  /// Marks the store reachable or not; an unreachable store fails `ready`.
  pub fn set_available(&self, available: bool) {
    self.available.store(available, Ordering::SeqCst);
  }

  fn read(&self) -> std::sync::RwLockReadGuard<'_, Collections> {
    self.collections.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> std::sync::RwLockWriteGuard<'_, Collections> {
    self.collections.write().unwrap_or_else(|e| e.into_inner())
  }

  /// Inserts or replaces `record` by its `_id`.
  pub fn upsert(&self, collection: &str, record: Value) -> Result<(), StoreError> {
    let id = record
      .get(ID_FIELD)
      .and_then(Value::as_str)
      .ok_or_else(|| StoreError::MissingIdentity {
        collection: collection.to_string(),
      })?
      .to_string();
    self
      .write()
      .entry(collection.to_string())
      .or_default()
      .insert(id, record);
    Ok(())
  }

  /// Removes a record; returns whether it existed.
  pub fn remove(&self, collection: &str, id: &str) -> bool {
    self
      .write()
      .get_mut(collection)
      .is_some_and(|records| records.remove(id).is_some())
  }

  /// Returns one record.
  pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
    self.read().get(collection).and_then(|records| records.get(id).cloned())
  }

  /// Returns every record of a collection ordered by id.
  pub fn records(&self, collection: &str) -> Vec<Value> {
    self
      .read()
      .get(collection)
      .map(|records| records.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Returns the total number of records.
  pub fn len(&self) -> usize {
    self.read().values().map(BTreeMap::len).sum()
  }

  /// Returns true if no record is stored.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns a copy of the whole state, for comparisons.
  pub fn dump(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
    self.read().clone()
  }

  /// Applies a mutation and records it in `log`.
  pub async fn commit(
    &self,
    log: &OperationLog,
    operation_type: &str,
    collection: &str,
    record: Value,
  ) -> Result<OperationLogEntry, StoreError> {
    self.upsert(collection, record.clone())?;
    Ok(
      log
        .append_operation(operation_type, json!({ "collection": collection, "record": record }))
        .await,
    )
  }

  /// Deletes a record and records the deletion in `log`.
  pub async fn commit_delete(
    &self,
    log: &OperationLog,
    operation_type: &str,
    collection: &str,
    id: &str,
  ) -> OperationLogEntry {
    self.remove(collection, id);
    log
      .append_operation(operation_type, json!({ "collection": collection, "id": id }))
      .await
  }

  // Ok(false) when the entry's effect is already present.
  fn apply_entry(&self, entry: &OperationLogEntry) -> Result<bool, StoreError> {
    let collection = entry
      .payload
      .get("collection")
      .and_then(Value::as_str)
      .ok_or_else(|| StoreError::MalformedOperation(format!("{} has no collection", entry.id)))?;
    if entry.operation_type.ends_with("-deleted") {
      let id = entry
        .payload
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::MalformedOperation(format!("{} has no id", entry.id)))?;
      return Ok(self.remove(collection, id));
    }
    let record = entry
      .payload
      .get("record")
      .cloned()
      .ok_or_else(|| StoreError::MalformedOperation(format!("{} has no record", entry.id)))?;
    let current = record
      .get(ID_FIELD)
      .and_then(Value::as_str)
      .and_then(|id| self.get(collection, id));
    if current.as_ref() == Some(&record) {
      return Ok(false);
    }
    self.upsert(collection, record)?;
    Ok(true)
  }
}

fn created_at(record: &Value) -> Option<DateTime<Utc>> {
  record
    .get(CREATED_AT_FIELD)
    .and_then(Value::as_str)
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl RecoveryHandler for RecordStore {
  async fn ready(&self) -> Result<(), ApplyError> {
    if self.available.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(ApplyError::Failed(StoreError::Unavailable.to_string()))
    }
  }

  async fn apply_restored_record(&self, collection: &str, record: &Value) -> Result<(), ApplyError> {
    self
      .upsert(collection, record.clone())
      .map_err(|e| ApplyError::Failed(e.to_string()))
  }

  async fn apply_replayed_operation(&self, entry: &OperationLogEntry) -> Result<(), ApplyError> {
    match self.apply_entry(entry) {
      Ok(true) => Ok(()),
      Ok(false) => Err(ApplyError::Duplicate),
      Err(e) => Err(ApplyError::Failed(e.to_string())),
    }
  }
}

#[async_trait]
impl SnapshotSource for RecordStore {
  async fn snapshot(&self, window: &SnapshotWindow) -> Result<SnapshotPayload, CheckpointError> {
    let since = window.since(self.wall_clock.now());
    let collections = self.read();
    let mut payload = SnapshotPayload::new();
    for (name, records) in collections.iter() {
      let mut recent: Vec<&Value> = records
        .values()
        .filter(|r| created_at(r).is_none_or(|t| t >= since))
        .collect();
      recent.sort_by_key(|r| created_at(r));
      let skip = recent.len().saturating_sub(window.max_records);
      payload
        .collections
        .insert(name.clone(), recent.into_iter().skip(skip).cloned().collect());
    }
    let total = collections.values().map(BTreeMap::len).sum::<usize>();
    Ok(payload.with_metadata("totalRecords", json!(total)))
  }
}
