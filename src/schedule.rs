//! Fixed-interval recurring tasks with explicit start and stop.
//!
//! Every periodic duty of a node (checkpoint creation, sync verification,
//! leader heartbeat, follower liveness checks, delivery sweeping) runs as its
//! own [`RecurringTask`]. Tasks are independent: a slow run of one never delays
//! another. Timers use `tokio::time`, so tests drive them with a paused clock.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Handle to a spawned fixed-interval task.
///
/// Dropping the handle does not stop the task; call [`RecurringTask::stop`].
pub struct RecurringTask {
  name: &'static str,
  token: CancellationToken,
  handle: JoinHandle<()>,
}

impl RecurringTask {
  /// Spawns `job` every `period`, first run one `period` after start.
  pub fn start<F, Fut>(name: &'static str, period: Duration, job: F) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    Self::start_after(name, period, period, job)
  }

  /// Spawns `job` every `period`, first run after `initial_delay`.
  pub fn start_after<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    mut job: F,
  ) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let token = CancellationToken::new();
    let child = token.clone();
    let handle = tokio::spawn(async move {
      let start = tokio::time::Instant::now() + initial_delay;
      let mut ticker = tokio::time::interval_at(start, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      debug!(task = name, period_ms = period.as_millis() as u64, "recurring task started");
      loop {
        tokio::select! {
          _ = child.cancelled() => break,
          _ = ticker.tick() => {
            trace!(task = name, "recurring task tick");
            job().await;
          }
        }
      }
      debug!(task = name, "recurring task stopped");
    });
    Self {
      name,
      token,
      handle,
    }
  }

  /// Returns the task name.
  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Returns true once the task loop has exited.
  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }

  /// Signals the task to stop and waits for the loop to exit.
  ///
  /// A run in progress completes before the loop observes the signal.
  pub async fn stop(self) {
    self.token.cancel();
    let _ = self.handle.await;
  }
}
