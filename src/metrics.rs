//! Prometheus-compatible metrics for rollcall nodes.
//!
//! Everything that degrades gracefully (dropped deliveries, skipped replay
//! entries, failed persistence writes, batch item failures) is only observable
//! through logs and these metrics. Use [`install_prometheus_recorder_on`] at
//! startup to expose them for scraping.
//!
//! If no recorder is installed, recording is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollcall::metrics;
//!
//! metrics::install_prometheus_recorder_on("0.0.0.0:9090".parse().unwrap()).unwrap();
//! ```

use ::metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Installs the Prometheus recorder and serves metrics on the given address.
///
/// Spawns an HTTP listener serving `GET /metrics`. Call once at startup, from
/// inside a tokio runtime.
pub fn install_prometheus_recorder_on(addr: std::net::SocketAddr) -> Result<(), BuildError> {
  PrometheusBuilder::new().with_http_listener(addr).install()
}

/// Records the outcome of an election run on this node.
pub fn record_election(node_id: u32, became_leader: bool) {
  counter!(
    "rollcall_elections_total",
    "node_id" => node_id.to_string(),
    "outcome" => if became_leader { "leader" } else { "follower" }
  )
  .increment(1);
  gauge!("rollcall_is_leader", "node_id" => node_id.to_string())
    .set(if became_leader { 1.0 } else { 0.0 });
}

/// Records a step-down caused by a higher-id claimant.
pub fn record_step_down(node_id: u32) {
  gauge!("rollcall_is_leader", "node_id" => node_id.to_string()).set(0.0);
  counter!("rollcall_step_downs_total", "node_id" => node_id.to_string()).increment(1);
}

/// Records a leader heartbeat.
pub fn record_leader_heartbeat(node_id: u32) {
  counter!("rollcall_leader_heartbeats_total", "node_id" => node_id.to_string()).increment(1);
}

/// Records a message dropped after exhausting its delivery attempts.
pub fn record_delivery_dropped(event: &str) {
  counter!("rollcall_delivery_dropped_total", "event" => event.to_string()).increment(1);
}

/// Records a message delivered by the reliable queue.
pub fn record_delivery_succeeded(event: &str, attempts: u32) {
  counter!("rollcall_delivery_succeeded_total", "event" => event.to_string()).increment(1);
  if attempts > 1 {
    counter!("rollcall_delivery_retried_total", "event" => event.to_string())
      .increment(u64::from(attempts - 1));
  }
}

/// Sets the number of messages currently awaiting acknowledgment.
pub fn record_pending_messages(count: usize) {
  gauge!("rollcall_delivery_pending").set(count as f64);
}

/// Records an operation appended to the log.
pub fn record_operation_logged(operation_type: &str) {
  counter!("rollcall_operations_logged_total", "type" => operation_type.to_string()).increment(1);
}

/// Records a failed durable write (log partition or checkpoint file).
pub fn record_persistence_failure(target: &str) {
  counter!("rollcall_persistence_failures_total", "target" => target.to_string()).increment(1);
}

/// Records a checkpoint written on this node.
pub fn record_checkpoint_created(kind: &str) {
  counter!("rollcall_checkpoints_created_total", "type" => kind.to_string()).increment(1);
}

/// Records the counters of a finished recovery.
pub fn record_recovery(replayed: usize, duplicates: usize, failed: usize) {
  counter!("rollcall_replay_applied_total").increment(replayed as u64);
  counter!("rollcall_replay_duplicates_total").increment(duplicates as u64);
  counter!("rollcall_replay_failed_total").increment(failed as u64);
}

/// Records the item counts of a finished batch.
pub fn record_batch(succeeded: usize, failed: usize, chunks: usize) {
  counter!("rollcall_batch_items_total", "outcome" => "succeeded").increment(succeeded as u64);
  counter!("rollcall_batch_items_total", "outcome" => "failed").increment(failed as u64);
  counter!("rollcall_batch_chunks_total").increment(chunks as u64);
}

/// Records one sync verification pass.
pub fn record_sync_verification(in_sync: usize, resent: usize, ahead: usize, unreachable: usize) {
  counter!("rollcall_sync_peers_total", "state" => "in_sync").increment(in_sync as u64);
  counter!("rollcall_sync_peers_total", "state" => "resent").increment(resent as u64);
  counter!("rollcall_sync_peers_total", "state" => "ahead").increment(ahead as u64);
  counter!("rollcall_sync_peers_total", "state" => "unreachable").increment(unreachable as u64);
}
