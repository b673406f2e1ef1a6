use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rollcall::batch::Count;
use rollcall::checkpoint::{
  Checkpoint, CheckpointKind, CheckpointStorage, InMemoryCheckpointStorage, SnapshotPayload,
};
use rollcall::config::NodeConfig;
use rollcall::delivery::{
  DeliveryError, DeliveryEvent, DeliveryReceipt, DeliveryTransport, DestinationSelector,
  OutboundMessage,
};
use rollcall::election::ElectionConfig;
use rollcall::node::{CoordinationNode, NodeError};
use rollcall::oplog::{InMemoryLogStore, OperationLogEntry};
use rollcall::peer::{HttpPeerClient, PeerError, PeerHandler};
use rollcall::replication::{ReplicationEvent, ReplicationMessage};
use rollcall::store::RecordStore;
use rollcall::time::{LogicalTime, ManualClock, Timestamped};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingTransport(Mutex<Vec<OutboundMessage>>);

#[async_trait]
impl DeliveryTransport for RecordingTransport {
  async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
    self.0.lock().unwrap().push(message.clone());
    Ok(DeliveryReceipt::Sent)
  }
}

struct Harness {
  node: Arc<CoordinationNode>,
  store: Arc<RecordStore>,
  events: Arc<RecordingTransport>,
}

fn harness(worker_id: u32, peer_count: u32) -> Harness {
  let wall_clock = Arc::new(ManualClock::new(
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap(),
  ));
  let mut config = NodeConfig::for_worker(worker_id)
    .with_listen_addr("127.0.0.1:0".parse().unwrap())
    .with_election(ElectionConfig::default().with_settle_delay(Duration::from_millis(10)));
  config.peer_count = peer_count;

  let store = Arc::new(RecordStore::new(wall_clock.clone()));
  let events = Arc::new(RecordingTransport::default());
  let node = CoordinationNode::builder(config)
    .with_business(store.clone())
    .with_wall_clock(wall_clock)
    .with_event_transport(events.clone())
    .with_log_store(Arc::new(InMemoryLogStore::new()))
    .with_checkpoint_storage(Arc::new(InMemoryCheckpointStorage::new()))
    .build()
    .unwrap();
  Harness {
    node,
    store,
    events,
  }
}

#[tokio::test(start_paused = true)]
async fn test_single_node_leads_checkpoints_and_shuts_down() {
  let Harness { node, store, .. } = harness(1, 1);
  assert!(!node.is_leader());
  node.start();

  let mut leader = node.leader_handle();
  let state = leader.wait_for(|s| s.is_self_leader).await.unwrap();
  assert_eq!(state.current_leader_id, Some(1));
  assert!(node.is_leader());

  store
    .commit(
      node.operation_log(),
      "student-created",
      "students",
      json!({"_id": "s1", "name": "Asha"}),
    )
    .await
    .unwrap();
  assert_eq!(node.current_logical_time(), LogicalTime::new(1));

  let checkpoint = node.create_checkpoint().await.unwrap();
  assert_eq!(checkpoint.kind, CheckpointKind::FullSystem);
  assert_eq!(checkpoint.operation_count_at_snapshot, 1);
  assert_eq!(checkpoint.snapshot_payload.collections["students"].len(), 1);

  let info = node.system_info().await;
  assert_eq!(info.last_checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));
  assert_eq!(info.buffered_operations, 1);
  assert!(info.is_leader);

  let last = node.shutdown().await.unwrap();
  assert_eq!(last.snapshot_payload.metadata["checkpointReason"], "shutdown");
}

#[tokio::test]
async fn test_replicated_checkpoint_is_verified_before_storing() {
  let Harness { node, .. } = harness(1, 2);
  let payload = SnapshotPayload::new().with_collection("students", vec![json!({"_id": "s9"})]);
  let checkpoint = Checkpoint::new(
    CheckpointKind::FullSystem,
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap(),
    "node-2",
    payload,
    3,
  )
  .unwrap();

  let mut forged = checkpoint.clone();
  forged.integrity_digest = "0".repeat(64);
  let result = node
    .replicate(ReplicationMessage {
      message_id: "repl_1".into(),
      event: ReplicationEvent::Checkpoint,
      origin_node_id: "node-2".into(),
      stamped: Timestamped::new(serde_json::to_value(&forged).unwrap(), LogicalTime::new(40)),
    })
    .await;
  assert!(matches!(result, Err(PeerError::Rejected(_))));
  assert!(node.checkpoints().latest().is_none());
  assert_eq!(node.current_logical_time(), LogicalTime::new(41));

  node
    .replicate(ReplicationMessage {
      message_id: "repl_2".into(),
      event: ReplicationEvent::Checkpoint,
      origin_node_id: "node-2".into(),
      stamped: Timestamped::new(serde_json::to_value(&checkpoint).unwrap(), LogicalTime::new(42)),
    })
    .await
    .unwrap();
  let digest = node.sync_digest().await;
  assert_eq!(digest.latest_checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));
  assert_eq!(digest.digest.as_deref(), Some(checkpoint.integrity_digest.as_str()));
}

#[tokio::test]
async fn test_replicated_operation_joins_the_log() {
  let Harness { node, .. } = harness(1, 2);
  let entry = OperationLogEntry {
    id: "op_remote".into(),
    wall_clock_time: Utc.with_ymd_and_hms(2024, 3, 4, 8, 30, 0).unwrap(),
    origin_node_id: "node-2".into(),
    logical_time: LogicalTime::new(17),
    operation_type: "attendance-marked".into(),
    payload: json!({"collection": "attendance", "record": {"_id": "a1"}}),
  };
  node
    .replicate(ReplicationMessage {
      message_id: "repl_3".into(),
      event: ReplicationEvent::Operation,
      origin_node_id: "node-2".into(),
      stamped: Timestamped::new(serde_json::to_value(&entry).unwrap(), LogicalTime::new(18)),
    })
    .await
    .unwrap();

  let buffered = node.operation_log().buffered();
  assert_eq!(buffered, vec![entry]);
  assert!(node.current_logical_time() > LogicalTime::new(18));
}

#[tokio::test]
async fn test_emit_reliable_goes_through_event_transport() {
  let Harness { node, events, .. } = harness(1, 1);
  let mut lifecycle = node.event_queue().subscribe();

  let ids = node
    .emit_reliable(
      DestinationSelector::One("faculty-room".into()),
      "attendance-updated",
      json!({"studentId": "s1"}),
    )
    .await;
  assert_eq!(ids.len(), 1);

  match lifecycle.recv().await.unwrap() {
    DeliveryEvent::Delivered { id, destination, attempts } => {
      assert_eq!(id, ids[0]);
      assert_eq!(destination, "faculty-room");
      assert_eq!(attempts, 1);
    }
    other => panic!("unexpected event {other:?}"),
  }
  let sent = events.0.lock().unwrap();
  assert_eq!(sent[0].payload["studentId"], "s1");
  assert_eq!(sent[0].payload["lamportTime"], 1);
  assert_eq!(sent[0].payload["nodeId"], "node-1");
}

#[tokio::test]
async fn test_run_parallel_isolates_item_failures() {
  let Harness { node, .. } = harness(1, 1);
  let items: Vec<u32> = (0..50).collect();
  let report = node
    .run_parallel(items, 7, |item: &u32| {
      if *item == 13 {
        Err("bad record".to_string())
      } else {
        Ok(Count(1))
      }
    })
    .await
    .unwrap();
  assert_eq!(report.result, Count(49));
  assert_eq!(report.chunks, 8);
  assert_eq!(report.errors.len(), 1);
  assert_eq!(report.errors[0].index, 13);

  let result = node.run_parallel(vec![1u32], 0, |_: &u32| Ok(Count(1))).await;
  assert!(matches!(result, Err(NodeError::Batch(_))));
}

#[tokio::test]
async fn test_panicked_server_leaves_emergency_checkpoint() {
  let Harness { node, .. } = harness(1, 1);
  let shutdown = CancellationToken::new();
  let serving = tokio::spawn(async {
    let listener: Option<()> = None;
    listener.expect("listener lost");
    Ok::<(), PeerError>(())
  });

  let result = node
    .run_until(serving, std::future::pending(), shutdown.clone())
    .await;
  assert!(matches!(result, Err(NodeError::ServerTask(_))));
  assert!(shutdown.is_cancelled());

  let stored = node.checkpoints().storage().list().await.unwrap();
  let emergency = stored
    .iter()
    .find(|c| c.kind == CheckpointKind::Emergency)
    .expect("emergency checkpoint");
  assert!(
    emergency.snapshot_payload.metadata["checkpointReason"]
      .as_str()
      .unwrap()
      .contains("peer server task failed")
  );
  assert!(
    stored
      .iter()
      .any(|c| c.snapshot_payload.metadata.get("checkpointReason") == Some(&json!("shutdown")))
  );
}

#[tokio::test]
async fn test_stop_signal_shuts_down_cleanly() {
  let Harness { node, .. } = harness(1, 1);
  let shutdown = CancellationToken::new();
  let serving = tokio::spawn({
    let shutdown = shutdown.clone();
    async move {
      shutdown.cancelled().await;
      Ok::<(), PeerError>(())
    }
  });

  node
    .run_until(serving, std::future::ready(()), shutdown.clone())
    .await
    .unwrap();
  assert!(shutdown.is_cancelled());
  let stored = node.checkpoints().storage().list().await.unwrap();
  assert!(stored.iter().all(|c| c.kind == CheckpointKind::FullSystem));
}

#[tokio::test]
async fn test_health_is_served_over_http() {
  let Harness { node, .. } = harness(2, 3);
  let server = node.bind().await.unwrap();
  let base = format!("http://{}", server.local_addr().unwrap());
  let shutdown = CancellationToken::new();
  tokio::spawn(server.run(shutdown.clone()));

  let client = HttpPeerClient::new();
  let health = client.health(&base).await.unwrap();
  assert!(health.is_ok());
  assert_eq!(health.node_id, "node-2");
  assert_eq!(health.worker_id, 2);
  assert!(!health.is_leader);

  let answer = client.send_step_down(&base, 3).await.unwrap();
  assert!(answer.accepted);
  assert_eq!(node.leader_state().current_leader_id, Some(3));
  shutdown.cancel();
}
