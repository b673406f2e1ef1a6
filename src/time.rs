//! Logical and wall-clock time for cross-process ordering.
//!
//! This module provides [`LogicalTime`], the Lamport timestamp carried by every
//! cross-process message and every operation log entry, and [`LamportClock`],
//! the process-local counter that hands them out.
//!
//! ## Ordering contract
//!
//! - **Local**: successive values returned by [`LamportClock::tick`] and
//!   [`LamportClock::observe`] on one instance strictly increase.
//! - **Causal**: across processes, causal order holds only if every send carries
//!   the sender's logical time (see [`Timestamped`]) and every receive calls
//!   [`LamportClock::observe`] before emitting further events.
//! - **Restart**: the clock is not persisted; a restarted process starts at zero.
//!
//! Wall-clock time is read through the [`WallClock`] trait so log stamping and
//! checkpoint creation can be driven deterministically in tests.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Lamport timestamp attached to events and log entries.
///
/// Implements [`Ord`] and [`Default`] (0) so it can be used directly as a sort key.
#[derive(
  Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
  /// Creates a new logical time from a raw value.
  #[inline]
  pub const fn new(t: u64) -> Self {
    Self(t)
  }

  /// Returns the raw u64 value.
  #[inline]
  pub const fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for LogicalTime {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A payload with the logical time it was stamped with.
///
/// Replication pushes carry one flattened into their envelope; the receiver
/// calls [`LamportClock::observe`] on it before acting on the payload.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamped<T> {
  /// Logical time of the sender when the payload was emitted.
  pub logical_time: LogicalTime,
  /// The payload.
  pub payload: T,
}

impl<T> Timestamped<T> {
  /// Pairs `payload` with `logical_time`.
  pub const fn new(payload: T, logical_time: LogicalTime) -> Self {
    Self {
      logical_time,
      payload,
    }
  }
}

/// Process-local Lamport clock.
///
/// Lock-free; share it behind an `Arc` between every task that emits or
/// receives events.
#[derive(Debug, Default)]
pub struct LamportClock {
  counter: AtomicU64,
}

impl LamportClock {
  /// Creates a clock starting at zero.
  pub fn new() -> Self {
    Self::default()
  }

  /// Advances the clock for a local or send event and returns the new value.
  pub fn tick(&self) -> LogicalTime {
    LogicalTime(self.counter.fetch_add(1, AtomicOrdering::SeqCst) + 1)
  }

  /// Merges a received timestamp: the counter becomes `max(local, received) + 1`.
  pub fn observe(&self, received: LogicalTime) -> LogicalTime {
    let mut current = self.counter.load(AtomicOrdering::SeqCst);
    loop {
      let next = current.max(received.0) + 1;
      match self.counter.compare_exchange_weak(
        current,
        next,
        AtomicOrdering::SeqCst,
        AtomicOrdering::SeqCst,
      ) {
        Ok(_) => return LogicalTime(next),
        Err(actual) => current = actual,
      }
    }
  }

  /// Returns the current value without advancing.
  pub fn current(&self) -> LogicalTime {
    LogicalTime(self.counter.load(AtomicOrdering::SeqCst))
  }

  /// Stamps a payload with a fresh tick.
  pub fn stamp<T>(&self, payload: T) -> Timestamped<T> {
    Timestamped::new(payload, self.tick())
  }
}

/// Source of wall-clock time.
pub trait WallClock: Send + Sync {
  /// Returns the current wall-clock time.
  fn now(&self) -> DateTime<Utc>;
}

/// [`WallClock`] backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// [`WallClock`] that only moves when told to.
///
/// Used to drive log stamping and checkpoint creation deterministically.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  /// Creates a clock frozen at `start`.
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Moves the clock forward by `by`.
  pub fn advance(&self, by: chrono::Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  /// Sets the clock to `at`.
  pub fn set(&self, at: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
  }
}

impl WallClock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}
