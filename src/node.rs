//! The coordination node: every component wired together behind one facade.
//!
//! A [`CoordinationNode`] owns the node's logical clock, leader elector,
//! delivery queues, operation log and checkpoint store. The business layer
//! plugs in through [`NodeBuilder`] (recovery and snapshot hooks, a recipient
//! channel for real-time events, a group resolver) and then talks to the node
//! only through the methods on [`CoordinationNode`].
//!
//! Lifecycle:
//!
//! 1. [`NodeBuilder::build`] wires the components;
//! 2. [`CoordinationNode::recover`] waits for the business store and restores
//!    the latest checkpoint plus newer log entries;
//! 3. [`CoordinationNode::start`] launches the election and the recurring
//!    tasks;
//! 4. [`CoordinationNode::serve`] answers peers until cancelled;
//! 5. [`CoordinationNode::shutdown`] stops the tasks and writes a final
//!    checkpoint.

use crate::batch::{BatchError, BatchReport, NoConnection, ParallelBatchExecutor, Reduce};
use crate::checkpoint::{
  Checkpoint, CheckpointError, CheckpointKind, CheckpointStorage, CheckpointStore,
  FileCheckpointStorage, SnapshotSource, start_periodic_checkpoints,
};
use crate::config::{ConfigError, NodeConfig};
use crate::delivery::{
  DeliveryTransport, DestinationResolver, DestinationSelector, MessageId, ReliableDeliveryQueue,
  ReliableEmitter, TracingTransport,
};
use crate::election::{
  ElectionError, ElectorTasks, LeaderElector, LeaderHandle, LeaderState, PeerClient, PeerId, PeerSet,
};
use crate::oplog::{FileLogStore, LogStore, OperationLog, OperationLogEntry};
use crate::peer::{
  HealthStatus, HttpPeerClient, PeerError, PeerHandler, PeerServer, StepDownAnswer, SyncDigest,
  SystemInfo,
};
use crate::recovery::{RecoveryCoordinator, RecoveryError, RecoveryHandler, RecoveryOutcome};
use crate::replication::{LeaderFanout, ReplicationEvent, ReplicationMessage, Replicator};
use crate::schedule::RecurringTask;
use crate::sync::{DigestProbe, SyncVerifier};
use crate::time::{LamportClock, LogicalTime, SystemClock, Timestamped, WallClock};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
  /// Invalid configuration.
  #[error("configuration error: {0}")]
  Config(#[from] ConfigError),
  /// Invalid peer set.
  #[error("election error: {0}")]
  Election(#[from] ElectionError),
  /// Peer server failure.
  #[error("peer error: {0}")]
  Peer(#[from] PeerError),
  /// The peer server task panicked or was aborted.
  #[error("peer server task failed: {0}")]
  ServerTask(#[source] JoinError),
  /// Startup recovery failed.
  #[error("recovery failed: {0}")]
  Recovery(#[from] RecoveryError),
  /// Checkpoint creation failed.
  #[error("checkpoint error: {0}")]
  Checkpoint(#[from] CheckpointError),
  /// A batch could not run.
  #[error("batch error: {0}")]
  Batch(#[from] BatchError),
  /// A required business hook was not registered.
  #[error("missing {0}")]
  Missing(&'static str),
}

impl NodeError {
  /// Returns true for failures that must halt the node.
  pub fn is_fatal(&self) -> bool {
    match self {
      NodeError::Recovery(e) => {
        e.is_integrity_failure() || matches!(e, RecoveryError::NotReady { .. })
      }
      _ => false,
    }
  }
}

/// Assembles a [`CoordinationNode`].
pub struct NodeBuilder {
  config: NodeConfig,
  wall_clock: Arc<dyn WallClock>,
  recovery_handler: Option<Arc<dyn RecoveryHandler>>,
  snapshot_source: Option<Arc<dyn SnapshotSource>>,
  event_transport: Arc<dyn DeliveryTransport>,
  resolver: Option<Arc<dyn DestinationResolver>>,
  peer_client: Option<Arc<dyn PeerClient>>,
  replication_transport: Option<Arc<dyn DeliveryTransport>>,
  digest_probe: Option<Arc<dyn DigestProbe>>,
  log_store: Option<Arc<dyn LogStore>>,
  checkpoint_storage: Option<Arc<dyn CheckpointStorage>>,
}

impl NodeBuilder {
  /// Starts a builder over `config`.
  pub fn new(config: NodeConfig) -> Self {
    Self {
      config,
      wall_clock: Arc::new(SystemClock),
      recovery_handler: None,
      snapshot_source: None,
      event_transport: Arc::new(TracingTransport),
      resolver: None,
      peer_client: None,
      replication_transport: None,
      digest_probe: None,
      log_store: None,
      checkpoint_storage: None,
    }
  }

  /// Registers a business store implementing both hooks.
  pub fn with_business<B>(self, business: Arc<B>) -> Self
  where
    B: RecoveryHandler + SnapshotSource + 'static,
  {
    let handler: Arc<dyn RecoveryHandler> = business.clone();
    let source: Arc<dyn SnapshotSource> = business;
    self.with_recovery_handler(handler).with_snapshot_source(source)
  }

  /// Registers the recovery hooks.
  pub fn with_recovery_handler(mut self, handler: Arc<dyn RecoveryHandler>) -> Self {
    self.recovery_handler = Some(handler);
    self
  }

  /// Registers the checkpoint snapshot source.
  pub fn with_snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
    self.snapshot_source = Some(source);
    self
  }

  /// Sets the channel carrying real-time business events.
  pub fn with_event_transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
    self.event_transport = transport;
    self
  }

  /// Sets the group resolver used by [`DestinationSelector::Group`].
  pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  /// Replaces the wall clock.
  pub fn with_wall_clock(mut self, wall_clock: Arc<dyn WallClock>) -> Self {
    self.wall_clock = wall_clock;
    self
  }

  /// Replaces the election transport.
  pub fn with_peer_client(mut self, client: Arc<dyn PeerClient>) -> Self {
    self.peer_client = Some(client);
    self
  }

  /// Replaces the replication transport.
  pub fn with_replication_transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
    self.replication_transport = Some(transport);
    self
  }

  /// Replaces the sync digest probe.
  pub fn with_digest_probe(mut self, probe: Arc<dyn DigestProbe>) -> Self {
    self.digest_probe = Some(probe);
    self
  }

  /// Replaces the durable log store.
  pub fn with_log_store(mut self, store: Arc<dyn LogStore>) -> Self {
    self.log_store = Some(store);
    self
  }

  /// Replaces the checkpoint storage.
  pub fn with_checkpoint_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
    self.checkpoint_storage = Some(storage);
    self
  }

  /// Wires the node.
  pub fn build(self) -> Result<Arc<CoordinationNode>, NodeError> {
    let config = self.config;
    config.validate()?;
    let recovery_handler = self.recovery_handler.ok_or(NodeError::Missing("recovery handler"))?;
    let snapshot_source = self.snapshot_source.ok_or(NodeError::Missing("snapshot source"))?;

    let http = Arc::new(HttpPeerClient::new().with_request_timeout(config.peer_request_timeout));
    let peer_client = self
      .peer_client
      .unwrap_or_else(|| http.clone() as Arc<dyn PeerClient>);
    let replication_transport = self
      .replication_transport
      .unwrap_or_else(|| http.clone() as Arc<dyn DeliveryTransport>);
    let digest_probe = self
      .digest_probe
      .unwrap_or_else(|| http as Arc<dyn DigestProbe>);

    let peers = PeerSet::new(
      config.worker_id,
      config.peer_count,
      config.peer_host.clone(),
      config.base_port,
    )?;
    let peer_addresses: Vec<String> = peers.others().map(|id| peers.address_of(id)).collect();
    let elector = LeaderElector::new(peers, peer_client, config.election.clone());
    let clock = Arc::new(LamportClock::new());

    let replication_queue = ReliableDeliveryQueue::new(replication_transport, config.delivery.clone());
    let replicator: Arc<dyn Replicator> = Arc::new(LeaderFanout::new(
      config.node_id.clone(),
      elector.handle(),
      Arc::clone(&clock),
      replication_queue.clone(),
      peer_addresses.clone(),
    ));

    let mut emitter = ReliableEmitter::new(
      ReliableDeliveryQueue::new(self.event_transport, config.delivery.clone()),
      Arc::clone(&clock),
      Arc::clone(&self.wall_clock),
      config.node_id.clone(),
    );
    if let Some(resolver) = self.resolver {
      emitter = emitter.with_resolver(resolver);
    }

    let log_store = self
      .log_store
      .unwrap_or_else(|| Arc::new(FileLogStore::new(config.log_dir())) as Arc<dyn LogStore>);
    let operation_log = Arc::new(
      OperationLog::new(
        config.node_id.clone(),
        Arc::clone(&clock),
        Arc::clone(&self.wall_clock),
        Arc::clone(&log_store),
        config.oplog.clone(),
      )
      .with_replicator(Arc::clone(&replicator)),
    );

    let checkpoint_storage = self
      .checkpoint_storage
      .unwrap_or_else(|| {
        Arc::new(FileCheckpointStorage::new(config.checkpoint_dir())) as Arc<dyn CheckpointStorage>
      });
    let checkpoints = Arc::new(
      CheckpointStore::new(config.node_id.clone(), Arc::clone(&self.wall_clock), checkpoint_storage)
        .with_replicator(Arc::clone(&replicator))
        .with_operation_log(Arc::clone(&operation_log)),
    );

    let sync = Arc::new(SyncVerifier::new(
      Arc::clone(&checkpoints),
      digest_probe,
      Arc::clone(&replicator),
      elector.handle(),
      peer_addresses,
    ));
    let recovery = RecoveryCoordinator::new(
      Arc::clone(&checkpoints),
      log_store,
      recovery_handler,
      Arc::clone(&clock),
      config.recovery.clone(),
    );
    let batch = ParallelBatchExecutor::new(NoConnection, config.batch.clone());

    info!(
      node = %config.node_id,
      worker = config.worker_id,
      peers = config.peer_count,
      "coordination node built"
    );
    Ok(Arc::new(CoordinationNode {
      config,
      clock,
      wall_clock: self.wall_clock,
      elector,
      replication_queue,
      emitter,
      operation_log,
      checkpoints,
      snapshot_source,
      recovery,
      sync,
      batch,
      tasks: Mutex::new(None),
    }))
  }
}

struct BackgroundTasks {
  elector: ElectorTasks,
  recurring: Vec<RecurringTask>,
}

/// One member of the coordination cluster.
pub struct CoordinationNode {
  config: NodeConfig,
  clock: Arc<LamportClock>,
  wall_clock: Arc<dyn WallClock>,
  elector: LeaderElector,
  replication_queue: ReliableDeliveryQueue,
  emitter: ReliableEmitter,
  operation_log: Arc<OperationLog>,
  checkpoints: Arc<CheckpointStore>,
  snapshot_source: Arc<dyn SnapshotSource>,
  recovery: RecoveryCoordinator,
  sync: Arc<SyncVerifier>,
  batch: ParallelBatchExecutor<NoConnection>,
  tasks: Mutex<Option<BackgroundTasks>>,
}

impl CoordinationNode {
  /// Starts a builder over `config`.
  pub fn builder(config: NodeConfig) -> NodeBuilder {
    NodeBuilder::new(config)
  }

  /// Returns the configuration.
  pub fn config(&self) -> &NodeConfig {
    &self.config
  }

  /// Returns the node label.
  pub fn node_id(&self) -> &str {
    &self.config.node_id
  }

  /// Returns the numeric peer id.
  pub fn worker_id(&self) -> PeerId {
    self.config.worker_id
  }

  /// Returns the current logical time without advancing it.
  pub fn current_logical_time(&self) -> LogicalTime {
    self.clock.current()
  }

  /// Advances the logical clock for a local event.
  pub fn tick(&self) -> LogicalTime {
    self.clock.tick()
  }

  /// Merges a received logical time into the clock.
  pub fn observe(&self, remote: LogicalTime) -> LogicalTime {
    self.clock.observe(remote)
  }

  /// Returns true while this node leads.
  pub fn is_leader(&self) -> bool {
    self.elector.is_leader()
  }

  /// Returns the current leadership view.
  pub fn leader_state(&self) -> LeaderState {
    self.elector.state()
  }

  /// Returns a watchable leadership handle.
  pub fn leader_handle(&self) -> LeaderHandle {
    self.elector.handle()
  }

  /// Returns the elector.
  pub fn elector(&self) -> &LeaderElector {
    &self.elector
  }

  /// Returns the operation log.
  pub fn operation_log(&self) -> &Arc<OperationLog> {
    &self.operation_log
  }

  /// Returns the checkpoint store.
  pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
    &self.checkpoints
  }

  /// Returns the queue carrying real-time events.
  pub fn event_queue(&self) -> &ReliableDeliveryQueue {
    self.emitter.queue()
  }

  /// Returns the queue carrying replication pushes.
  pub fn replication_queue(&self) -> &ReliableDeliveryQueue {
    &self.replication_queue
  }

  /// Emits a real-time event with retries; never fails the caller.
  pub async fn emit_reliable(
    &self,
    selector: DestinationSelector,
    event: &str,
    payload: Value,
  ) -> Vec<MessageId> {
    self.emitter.emit(selector, event, payload).await
  }

  /// Runs `worker` over `items` in chunks of `chunk_size` and reduces the results.
  pub async fn run_parallel<T, R, W>(
    &self,
    items: Vec<T>,
    chunk_size: usize,
    worker: W,
  ) -> Result<BatchReport<R>, NodeError>
  where
    T: Send + 'static,
    R: Reduce,
    W: Fn(&T) -> Result<R, String> + Send + Sync + 'static,
  {
    let handle = self
      .batch
      .submit(items, chunk_size, move |_: &mut (), item: &T| worker(item))?;
    Ok(handle.await?)
  }

  /// Records a committed business mutation.
  pub async fn append_operation(&self, operation_type: &str, payload: Value) -> OperationLogEntry {
    self.operation_log.append_operation(operation_type, payload).await
  }

  /// Snapshots the business state into a full-system checkpoint.
  pub async fn create_checkpoint(&self) -> Result<Checkpoint, NodeError> {
    Ok(
      self
        .checkpoints
        .create_checkpoint(
          CheckpointKind::FullSystem,
          self.snapshot_source.as_ref(),
          &self.config.checkpoint.window,
        )
        .await?,
    )
  }

  /// Snapshots the business state into an emergency checkpoint tagged with `reason`.
  pub async fn create_emergency_checkpoint(&self, reason: &str) -> Result<Checkpoint, NodeError> {
    Ok(
      self
        .checkpoints
        .create_emergency_checkpoint(
          reason,
          self.snapshot_source.as_ref(),
          &self.config.checkpoint.window,
        )
        .await?,
    )
  }

  /// Waits for the business store and restores the latest state.
  pub async fn recover(&self) -> Result<RecoveryOutcome, NodeError> {
    self.recovery.wait_until_ready().await?;
    Ok(self.recovery.recover().await?)
  }

  /// Starts the election and every recurring task. Calling it twice is a no-op.
  pub fn start(&self) {
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    if tasks.is_some() {
      return;
    }
    let elector = self.elector.start();
    let recurring = vec![
      self.replication_queue.start_sweeper(),
      self.emitter.queue().start_sweeper(),
      start_periodic_checkpoints(
        Arc::clone(&self.checkpoints),
        Arc::clone(&self.snapshot_source),
        self.elector.handle(),
        self.config.checkpoint.clone(),
      ),
      Arc::clone(&self.sync).start(self.config.sync.clone()),
    ];
    *tasks = Some(BackgroundTasks { elector, recurring });
    info!(node = %self.config.node_id, "node started");
  }

  /// Binds the peer server on the configured listen address.
  pub async fn bind(self: &Arc<Self>) -> Result<PeerServer, NodeError> {
    let handler: Arc<dyn PeerHandler> = Arc::clone(self) as Arc<dyn PeerHandler>;
    Ok(PeerServer::bind(self.config.listen_addr, handler).await?)
  }

  /// Serves peers on the configured address until `shutdown` is cancelled.
  pub async fn serve(self: &Arc<Self>, shutdown: CancellationToken) -> Result<(), NodeError> {
    let server = self.bind().await?;
    Ok(server.run(shutdown).await?)
  }

  /// Waits for `stop` or for the `serving` peer server task to end, then shuts
  /// down through [`Self::shutdown`].
  ///
  /// A server that fails or panics is returned as the error, after an
  /// emergency checkpoint tagged with the failure.
  pub async fn run_until<S>(
    &self,
    serving: JoinHandle<Result<(), PeerError>>,
    stop: S,
    shutdown: CancellationToken,
  ) -> Result<(), NodeError>
  where
    S: Future<Output = ()>,
  {
    let outcome = tokio::select! {
      () = stop => Ok(()),
      served = serving => match served {
        Ok(result) => result.map_err(NodeError::from),
        Err(e) => Err(NodeError::ServerTask(e)),
      },
    };

    shutdown.cancel();
    if let Err(e) = &outcome {
      error!(error = %e, "peer server stopped");
      if let Err(checkpoint_error) = self.create_emergency_checkpoint(&e.to_string()).await {
        error!(error = %checkpoint_error, "emergency checkpoint failed");
      }
    }
    self.shutdown().await;
    outcome
  }

  /// Stops the background tasks and writes a final full-system checkpoint.
  pub async fn shutdown(&self) -> Option<Checkpoint> {
    let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(tasks) = tasks {
      tasks.elector.stop().await;
      for task in tasks.recurring {
        task.stop().await;
      }
    }
    match self
      .checkpoints
      .create_tagged_checkpoint(
        CheckpointKind::FullSystem,
        "shutdown",
        self.snapshot_source.as_ref(),
        &self.config.checkpoint.window,
      )
      .await
    {
      Ok(checkpoint) => {
        info!(id = %checkpoint.id, "final checkpoint saved");
        Some(checkpoint)
      }
      Err(e) => {
        error!(error = %e, "final checkpoint failed");
        None
      }
    }
  }
}

#[async_trait]
impl PeerHandler for CoordinationNode {
  async fn health(&self) -> HealthStatus {
    HealthStatus {
      status: "ok".to_string(),
      node_id: self.config.node_id.clone(),
      worker_id: self.config.worker_id,
      is_leader: self.is_leader(),
      logical_time: self.current_logical_time(),
      timestamp: self.wall_clock.now(),
    }
  }

  async fn step_down(&self, claimant_id: PeerId) -> StepDownAnswer {
    let accepted = self.elector.handle_step_down(claimant_id);
    StepDownAnswer {
      accepted,
      is_leader: self.is_leader(),
    }
  }

  async fn replicate(&self, message: ReplicationMessage) -> Result<(), PeerError> {
    let Timestamped {
      logical_time,
      payload,
    } = message.stamped;
    self.clock.observe(logical_time);
    match message.event {
      ReplicationEvent::Checkpoint => {
        let checkpoint: Checkpoint = serde_json::from_value(payload)?;
        self
          .checkpoints
          .accept_replicated(checkpoint)
          .await
          .map_err(|e| {
            warn!(origin = %message.origin_node_id, error = %e, "rejected replicated checkpoint");
            PeerError::Rejected(e.to_string())
          })
      }
      ReplicationEvent::Operation => {
        let entry: OperationLogEntry = serde_json::from_value(payload)?;
        self.operation_log.record_replicated(entry).await;
        Ok(())
      }
    }
  }

  async fn sync_digest(&self) -> SyncDigest {
    let latest = self.checkpoints.latest();
    SyncDigest {
      node_id: self.config.node_id.clone(),
      latest_checkpoint_id: latest.as_ref().map(|c| c.id.clone()),
      latest_checkpoint_time: latest.as_ref().map(|c| c.wall_clock_time),
      digest: latest.map(|c| c.integrity_digest),
    }
  }

  async fn system_info(&self) -> SystemInfo {
    let leader = self.leader_state();
    SystemInfo {
      node_id: self.config.node_id.clone(),
      worker_id: self.config.worker_id,
      is_leader: leader.is_self_leader,
      current_leader_id: leader.current_leader_id,
      last_checkpoint_id: self.checkpoints.latest().map(|c| c.id),
      buffered_operations: self.operation_log.buffered_len(),
      pending_messages: self.replication_queue.pending_count() + self.emitter.queue().pending_count(),
      peer_count: self.config.peer_count,
      logical_time: self.current_logical_time(),
    }
  }
}
