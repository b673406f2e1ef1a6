//! Identifier generation for messages, operations and checkpoints.

use rand::Rng;

/// Returns `<prefix>_<unix millis>_<random hex>`.
///
/// Unique enough for entries produced by one node; replay order never depends
/// on it except as the final tie-breaker.
pub fn generate(prefix: &str) -> String {
  let millis = chrono::Utc::now().timestamp_millis();
  let suffix: u64 = rand::thread_rng().r#gen();
  format!("{prefix}_{millis}_{suffix:016x}")
}
