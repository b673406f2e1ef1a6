//! rollcall node binary.
//!
//! Reads its configuration from the environment (see [`rollcall::config`]),
//! recovers the local state, joins the election and serves peers until
//! Ctrl-C. Exits non-zero when the latest checkpoint fails its integrity check
//! or the business store never becomes reachable.

use rollcall::config::NodeConfig;
use rollcall::node::{CoordinationNode, NodeError};
use rollcall::recovery::RecoveryOutcome;
use rollcall::store::RecordStore;
use rollcall::time::SystemClock;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt::init();

  match run().await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!(error = %e, fatal = e.is_fatal(), "node stopped");
      ExitCode::FAILURE
    }
  }
}

async fn run() -> Result<(), NodeError> {
  let config = NodeConfig::from_env()?;
  if let Some(addr) = config.metrics_addr {
    match rollcall::metrics::install_prometheus_recorder_on(addr) {
      Ok(()) => info!(addr = %addr, "metrics exporter listening"),
      Err(e) => warn!(addr = %addr, error = %e, "metrics exporter disabled"),
    }
  }

  let store = Arc::new(RecordStore::new(Arc::new(SystemClock)));
  let node = CoordinationNode::builder(config).with_business(store).build()?;

  match node.recover().await? {
    RecoveryOutcome::NoPriorState => info!("starting without prior state"),
    RecoveryOutcome::Restored(report) => info!(
      checkpoint = %report.checkpoint_id,
      replayed = report.replayed,
      "state restored"
    ),
  }

  let server = node.bind().await?;
  info!(
    node = %node.node_id(),
    worker = node.worker_id(),
    addr = %server.local_addr()?,
    "node listening"
  );
  node.start();

  let shutdown = CancellationToken::new();
  let serving = tokio::spawn(server.run(shutdown.clone()));
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
  };
  node.run_until(serving, ctrl_c, shutdown).await
}
