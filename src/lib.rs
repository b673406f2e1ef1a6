//! # rollcall
//!
//! Coordination substrate for a small cluster of replicated record-keeping
//! nodes.
//!
//! Each node carries a Lamport clock, elects a leader with the Bully algorithm
//! over a fixed numbered peer set, records every committed business mutation
//! in an operation log, takes periodic integrity-checked checkpoints, and on
//! restart restores the latest checkpoint and replays the newer log entries.
//! Real-time events go out through a retrying delivery queue, and bulk work
//! runs through a chunked parallel batch executor with deterministic
//! reduction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rollcall::config::NodeConfig;
//! use rollcall::node::CoordinationNode;
//! use rollcall::store::RecordStore;
//! use rollcall::time::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), rollcall::node::NodeError> {
//! let store = Arc::new(RecordStore::new(Arc::new(SystemClock)));
//! let node = CoordinationNode::builder(NodeConfig::from_env()?)
//!   .with_business(store)
//!   .build()?;
//! node.recover().await?;
//! node.start();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Chunked parallel batch execution with deterministic reduction.
pub mod batch;
/// Integrity-checked checkpoints and their periodic creation.
pub mod checkpoint;
/// Node configuration and environment loading.
pub mod config;
/// Retrying delivery of real-time events.
pub mod delivery;
/// Bully leader election over a static peer set.
pub mod election;
/// Unique identifiers for messages and log entries.
pub mod id;
/// Prometheus-compatible metrics.
pub mod metrics;
/// The coordination node facade.
pub mod node;
/// Append-only operation log with day partitions.
pub mod oplog;
/// HTTP surface between peers.
pub mod peer;
/// Startup restore and replay.
pub mod recovery;
/// Leader-to-follower replication of checkpoints and operations.
pub mod replication;
/// Recurring fixed-interval tasks.
pub mod schedule;
/// In-memory record store used as the business collaborator.
pub mod store;
/// Leader-side sync verification.
pub mod sync;
/// Lamport logical clock and wall clocks.
pub mod time;

#[cfg(test)]
mod election_test;
