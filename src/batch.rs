//! Chunked parallel batch execution with deterministic reduction.
//!
//! [`ParallelBatchExecutor::submit`] splits the input into contiguous chunks
//! and runs each chunk on tokio's blocking pool. Every chunk opens its own
//! connection from the executor's [`ConnectionFactory`] and applies the worker
//! function to its items one by one:
//!
//! - a failing item is recorded as an [`ItemError`] and its siblings continue;
//! - a chunk whose connection cannot be opened, or whose unit panics, reports
//!   every item it owned as failed;
//! - no chunk failure aborts another chunk.
//!
//! Partial results are merged with [`Reduce::merge`] in chunk-index order, so
//! the result never depends on which chunk finished first.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Batch executor errors.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
  /// A chunk size of zero was requested.
  #[error("chunk size must be greater than zero")]
  InvalidChunkSize,
  /// A connection could not be opened for a chunk.
  #[error("connection failed: {0}")]
  Connection(String),
  /// The coordinating task was lost.
  #[error("batch task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// Opens the per-unit connection used by a chunk.
pub trait ConnectionFactory: Send + Sync + 'static {
  /// Connection handed to the worker function.
  type Connection: Send;

  /// Opens a connection. Called once per chunk, on the blocking pool.
  fn connect(&self) -> Result<Self::Connection, BatchError>;
}

/// Factory for work that needs no connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConnection;

impl ConnectionFactory for NoConnection {
  type Connection = ();

  fn connect(&self) -> Result<(), BatchError> {
    Ok(())
  }
}

/// Partial result that can absorb another one.
///
/// `merge` must be associative and `Default` its identity.
pub trait Reduce: Default + Send + 'static {
  /// Folds `other` into `self`.
  fn merge(&mut self, other: Self);
}

/// A failed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
  /// Position of the item in the submitted input.
  pub index: usize,
  /// Chunk that owned the item.
  pub chunk: usize,
  /// What went wrong.
  pub error: String,
}

/// Outcome of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport<R> {
  /// Merged result of every successful item.
  pub result: R,
  /// Items that succeeded.
  pub succeeded: usize,
  /// Items that failed.
  pub failed: usize,
  /// Chunks the input was split into.
  pub chunks: usize,
  /// Failed items in input order.
  pub errors: Vec<ItemError>,
}

impl<R> BatchReport<R> {
  /// Returns the number of submitted items.
  pub fn total(&self) -> usize {
    self.succeeded + self.failed
  }
}

struct ChunkOutcome<R> {
  partial: R,
  succeeded: usize,
  errors: Vec<ItemError>,
}

/// Future resolving to the [`BatchReport`] of a submitted batch.
pub struct BatchHandle<R> {
  inner: JoinHandle<BatchReport<R>>,
}

impl<R> Future for BatchHandle<R> {
  type Output = Result<BatchReport<R>, BatchError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.inner).poll(cx).map_err(BatchError::from)
  }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
  /// Chunks allowed to run at once.
  pub max_concurrency: usize,
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self {
      max_concurrency: std::thread::available_parallelism().map_or(4, |n| n.get()),
    }
  }
}

/// Runs batches of items on the blocking pool.
pub struct ParallelBatchExecutor<F: ConnectionFactory> {
  factory: Arc<F>,
  permits: Arc<Semaphore>,
}

impl<F: ConnectionFactory> ParallelBatchExecutor<F> {
  /// Creates an executor opening connections from `factory`.
  pub fn new(factory: F, config: BatchConfig) -> Self {
    Self {
      factory: Arc::new(factory),
      permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
    }
  }

  /// Splits `items` into chunks of at most `chunk_size` and processes them.
  ///
  /// Must be called from within a tokio runtime.
  pub fn submit<T, R, W>(
    &self,
    items: Vec<T>,
    chunk_size: usize,
    worker: W,
  ) -> Result<BatchHandle<R>, BatchError>
  where
    T: Send + 'static,
    R: Reduce,
    W: Fn(&mut F::Connection, &T) -> Result<R, String> + Send + Sync + 'static,
  {
    if chunk_size == 0 {
      return Err(BatchError::InvalidChunkSize);
    }
    let factory = Arc::clone(&self.factory);
    let permits = Arc::clone(&self.permits);
    let worker = Arc::new(worker);

    let inner = tokio::spawn(async move {
      let mut chunks: Vec<(usize, usize, JoinHandle<ChunkOutcome<R>>)> = Vec::new();
      let mut remaining = items.into_iter();
      let mut offset = 0;
      loop {
        let chunk: Vec<T> = remaining.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
          break;
        }
        let chunk_index = chunks.len();
        let len = chunk.len();
        let permit = Arc::clone(&permits).acquire_owned().await.ok();
        let factory = Arc::clone(&factory);
        let worker = Arc::clone(&worker);
        let handle = tokio::task::spawn_blocking(move || {
          let _permit = permit;
          run_chunk(&*factory, &*worker, chunk, chunk_index, offset)
        });
        chunks.push((offset, len, handle));
        offset += len;
      }

      let mut report = BatchReport {
        result: R::default(),
        succeeded: 0,
        failed: 0,
        chunks: chunks.len(),
        errors: Vec::new(),
      };
      for (chunk_index, (start, len, handle)) in chunks.into_iter().enumerate() {
        let outcome = match handle.await {
          Ok(outcome) => outcome,
          Err(e) => {
            warn!(chunk = chunk_index, error = %e, "batch unit crashed");
            failed_chunk(chunk_index, start, len, format!("unit crashed: {e}"))
          }
        };
        report.result.merge(outcome.partial);
        report.succeeded += outcome.succeeded;
        report.failed += outcome.errors.len();
        report.errors.extend(outcome.errors);
      }
      crate::metrics::record_batch(report.succeeded, report.failed, report.chunks);
      debug!(
        chunks = report.chunks,
        succeeded = report.succeeded,
        failed = report.failed,
        "batch completed"
      );
      report
    });
    Ok(BatchHandle { inner })
  }
}

fn failed_chunk<R: Reduce>(chunk: usize, start: usize, len: usize, error: String) -> ChunkOutcome<R> {
  ChunkOutcome {
    partial: R::default(),
    succeeded: 0,
    errors: (start..start + len)
      .map(|index| ItemError {
        index,
        chunk,
        error: error.clone(),
      })
      .collect(),
  }
}

fn run_chunk<F, T, R, W>(factory: &F, worker: &W, items: Vec<T>, chunk: usize, start: usize) -> ChunkOutcome<R>
where
  F: ConnectionFactory,
  R: Reduce,
  W: Fn(&mut F::Connection, &T) -> Result<R, String>,
{
  let mut connection = match factory.connect() {
    Ok(connection) => connection,
    Err(e) => {
      warn!(chunk, error = %e, "batch unit could not connect");
      return failed_chunk(chunk, start, items.len(), e.to_string());
    }
  };
  let mut outcome = ChunkOutcome {
    partial: R::default(),
    succeeded: 0,
    errors: Vec::new(),
  };
  for (offset, item) in items.iter().enumerate() {
    match worker(&mut connection, item) {
      Ok(partial) => {
        outcome.partial.merge(partial);
        outcome.succeeded += 1;
      }
      Err(error) => outcome.errors.push(ItemError {
        index: start + offset,
        chunk,
        error,
      }),
    }
  }
  outcome
}

/// Number of processed items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Count(pub u64);

impl Reduce for Count {
  fn merge(&mut self, other: Self) {
    self.0 += other.0;
  }
}

fn percentage(part: u64, whole: u64) -> f64 {
  if whole == 0 {
    0.0
  } else {
    part as f64 / whole as f64 * 100.0
  }
}

/// Students examined and how many of them are defaulters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
  /// Students counted.
  pub students: u64,
  /// Students below the attendance threshold.
  pub defaulters: u64,
}

impl Tally {
  /// Creates a tally.
  pub fn new(students: u64, defaulters: u64) -> Self {
    Self {
      students,
      defaulters,
    }
  }

  /// Tally of one student.
  pub fn student(is_defaulter: bool) -> Self {
    Self::new(1, u64::from(is_defaulter))
  }

  /// Defaulter percentage, recomputed from the counts.
  pub fn percentage(&self) -> f64 {
    percentage(self.defaulters, self.students)
  }
}

impl Reduce for Tally {
  fn merge(&mut self, other: Self) {
    self.students += other.students;
    self.defaulters += other.defaulters;
  }
}

/// Per-key tallies, e.g. per department.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Breakdown(pub BTreeMap<String, Tally>);

impl Breakdown {
  /// Breakdown with a single key.
  pub fn single(key: impl Into<String>, tally: Tally) -> Self {
    let mut map = BTreeMap::new();
    map.insert(key.into(), tally);
    Self(map)
  }

  /// Returns the tally of `key`.
  pub fn get(&self, key: &str) -> Option<&Tally> {
    self.0.get(key)
  }
}

impl Reduce for Breakdown {
  fn merge(&mut self, other: Self) {
    for (key, tally) in other.0 {
      self.0.entry(key).or_default().merge(tally);
    }
  }
}

/// Present sessions out of total sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttendanceSummary {
  /// Sessions attended.
  pub present: u64,
  /// Sessions held.
  pub total: u64,
}

impl AttendanceSummary {
  /// Attendance percentage, recomputed from the counts.
  pub fn percentage(&self) -> f64 {
    percentage(self.present, self.total)
  }

  /// Returns true below `threshold` percent. No sessions counts as 0%.
  pub fn is_below(&self, threshold: f64) -> bool {
    self.percentage() < threshold
  }
}

impl Reduce for AttendanceSummary {
  fn merge(&mut self, other: Self) {
    self.present += other.present;
    self.total += other.total;
  }
}

/// Defaulter analysis over a student population.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaulterReport {
  /// Whole population.
  pub overall: Tally,
  /// Per department.
  pub department_breakdown: Breakdown,
  /// Per subject.
  pub subject_breakdown: Breakdown,
}

impl DefaulterReport {
  /// Classifies one student of `department` against `threshold` percent.
  ///
  /// The student is a defaulter overall when their combined attendance is
  /// below the threshold, and per subject when that subject's is.
  pub fn student(department: &str, subjects: &[(String, AttendanceSummary)], threshold: f64) -> Self {
    let mut combined = AttendanceSummary::default();
    let mut subject_breakdown = Breakdown::default();
    for (subject, summary) in subjects {
      combined.merge(*summary);
      subject_breakdown.merge(Breakdown::single(subject.clone(), Tally::student(summary.is_below(threshold))));
    }
    let overall = Tally::student(combined.is_below(threshold));
    Self {
      overall,
      department_breakdown: Breakdown::single(department, overall),
      subject_breakdown,
    }
  }
}

impl Reduce for DefaulterReport {
  fn merge(&mut self, other: Self) {
    self.overall.merge(other.overall);
    self.department_breakdown.merge(other.department_breakdown);
    self.subject_breakdown.merge(other.subject_breakdown);
  }
}
