use crate::delivery::{DeliveryError, DeliveryReceipt, DeliveryTransport, OutboundMessage};
use crate::election::{ElectionError, PeerClient, PeerId, PeerNode};
use crate::peer::{
  HealthStatus, HttpPeerClient, PeerError, PeerHandler, PeerServer, StepDownAnswer, SyncDigest,
  SystemInfo,
};
use crate::replication::{ReplicationEvent, ReplicationMessage};
use crate::time::{LogicalTime, Timestamped};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
  status: &'static str,
  step_downs: Mutex<Vec<PeerId>>,
  replicated: Mutex<Vec<ReplicationMessage>>,
  reject_replication: bool,
}

#[async_trait]
impl PeerHandler for Recorder {
  async fn health(&self) -> HealthStatus {
    HealthStatus {
      status: self.status.to_string(),
      node_id: "node-2".into(),
      worker_id: 2,
      is_leader: false,
      logical_time: LogicalTime::new(7),
      timestamp: Utc::now(),
    }
  }

  async fn step_down(&self, claimant_id: PeerId) -> StepDownAnswer {
    self.step_downs.lock().unwrap().push(claimant_id);
    StepDownAnswer {
      accepted: claimant_id > 2,
      is_leader: false,
    }
  }

  async fn replicate(&self, message: ReplicationMessage) -> Result<(), PeerError> {
    if self.reject_replication {
      return Err(PeerError::Rejected("digest mismatch".into()));
    }
    self.replicated.lock().unwrap().push(message);
    Ok(())
  }

  async fn sync_digest(&self) -> SyncDigest {
    SyncDigest {
      node_id: "node-2".into(),
      latest_checkpoint_id: Some("full-system_1".into()),
      digest: Some("abc".into()),
      latest_checkpoint_time: None,
    }
  }

  async fn system_info(&self) -> SystemInfo {
    SystemInfo {
      node_id: "node-2".into(),
      worker_id: 2,
      is_leader: false,
      current_leader_id: Some(3),
      last_checkpoint_id: None,
      buffered_operations: 4,
      pending_messages: 0,
      peer_count: 3,
      logical_time: LogicalTime::new(7),
    }
  }
}

async fn serve(handler: Arc<Recorder>) -> (String, CancellationToken) {
  serve_limited(handler, crate::peer::DEFAULT_BODY_LIMIT).await
}

async fn serve_limited(handler: Arc<Recorder>, body_limit: usize) -> (String, CancellationToken) {
  let server = PeerServer::bind("127.0.0.1:0".parse().unwrap(), handler)
    .await
    .unwrap()
    .with_body_limit(body_limit);
  let addr = server.local_addr().unwrap();
  let shutdown = CancellationToken::new();
  tokio::spawn(server.run(shutdown.clone()));
  (format!("http://{addr}"), shutdown)
}

fn peer(base: &str) -> PeerNode {
  PeerNode {
    numeric_id: 2,
    health_endpoint: base.to_string(),
    last_known_alive: None,
  }
}

fn replication_push(base: &str) -> OutboundMessage {
  let envelope = ReplicationMessage {
    message_id: "repl_1".into(),
    event: ReplicationEvent::Operation,
    origin_node_id: "node-3".into(),
    stamped: Timestamped::new(json!({"id": "op_1"}), LogicalTime::new(12)),
  };
  OutboundMessage {
    id: "repl_1".into(),
    destination: base.to_string(),
    event: ReplicationEvent::Operation.as_str().to_string(),
    payload: serde_json::to_value(envelope).unwrap(),
    attempt: 1,
  }
}

#[tokio::test]
async fn test_health_probe_round_trip() {
  let handler = Arc::new(Recorder {
    status: "ok",
    ..Recorder::default()
  });
  let (base, shutdown) = serve(handler).await;
  let client = HttpPeerClient::new();

  let health = client.health(&base).await.unwrap();
  assert!(health.is_ok());
  assert_eq!(health.worker_id, 2);
  assert_eq!(health.logical_time, LogicalTime::new(7));
  assert!(client.probe(&peer(&base)).await.is_ok());

  let info = client.get_json::<SystemInfo>(&base, "/system-info").await.unwrap();
  assert_eq!(info.current_leader_id, Some(3));
  assert_eq!(info.buffered_operations, 4);
  shutdown.cancel();
}

#[tokio::test]
async fn test_unhealthy_status_fails_probe() {
  let handler = Arc::new(Recorder {
    status: "degraded",
    ..Recorder::default()
  });
  let (base, shutdown) = serve(handler).await;
  let result = HttpPeerClient::new().probe(&peer(&base)).await;
  assert!(matches!(result, Err(ElectionError::Unhealthy { peer: 2 })));
  shutdown.cancel();
}

#[tokio::test]
async fn test_step_down_reaches_handler() {
  let handler = Arc::new(Recorder {
    status: "ok",
    ..Recorder::default()
  });
  let (base, shutdown) = serve(handler.clone()).await;
  let client = HttpPeerClient::new();

  let answer = client.send_step_down(&base, 3).await.unwrap();
  assert!(answer.accepted);
  client.step_down(&peer(&base), 1).await.unwrap();
  assert_eq!(*handler.step_downs.lock().unwrap(), vec![3, 1]);
  shutdown.cancel();
}

#[tokio::test]
async fn test_replication_push_is_acknowledged() {
  let handler = Arc::new(Recorder {
    status: "ok",
    ..Recorder::default()
  });
  let (base, shutdown) = serve(handler.clone()).await;

  let receipt = HttpPeerClient::new()
    .deliver(&replication_push(&base))
    .await
    .unwrap();
  assert_eq!(receipt, DeliveryReceipt::Acknowledged);
  let replicated = handler.replicated.lock().unwrap();
  assert_eq!(replicated.len(), 1);
  assert_eq!(replicated[0].origin_node_id, "node-3");
  assert_eq!(replicated[0].stamped.logical_time, LogicalTime::new(12));
  shutdown.cancel();
}

#[tokio::test]
async fn test_rejected_replication_maps_to_rejected() {
  let handler = Arc::new(Recorder {
    status: "ok",
    reject_replication: true,
    ..Recorder::default()
  });
  let (base, shutdown) = serve(handler).await;
  let result = HttpPeerClient::new().deliver(&replication_push(&base)).await;
  assert!(matches!(result, Err(DeliveryError::Rejected(_))));
  shutdown.cancel();
}

#[tokio::test]
async fn test_oversized_body_is_refused() {
  let handler = Arc::new(Recorder {
    status: "ok",
    ..Recorder::default()
  });
  let (base, shutdown) = serve_limited(handler.clone(), 64).await;
  let client = HttpPeerClient::new();

  let result = client.deliver(&replication_push(&base)).await;
  assert!(matches!(result, Err(DeliveryError::Rejected(_))));
  assert!(handler.replicated.lock().unwrap().is_empty());
  let status = client
    .post_json::<_, Value>(&base, crate::peer::REPLICATE_PATH, &json!({"padding": "x".repeat(128)}))
    .await;
  assert!(matches!(status, Err(PeerError::Status(413))));

  let answer = client.send_step_down(&base, 3).await.unwrap();
  assert!(answer.accepted);
  shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
  let handler = Arc::new(Recorder {
    status: "ok",
    ..Recorder::default()
  });
  let (base, shutdown) = serve(handler).await;
  let result = HttpPeerClient::new().get_json::<Value>(&base, "/nope").await;
  assert!(matches!(result, Err(PeerError::Status(404))));

  let digest = HttpPeerClient::new().sync_digest(&base).await.unwrap();
  assert_eq!(digest.digest.as_deref(), Some("abc"));
  shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_peer_maps_to_unreachable() {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);
  let base = format!("http://{addr}");
  let client = HttpPeerClient::new().with_request_timeout(Duration::from_secs(2));

  assert!(matches!(
    client.deliver(&replication_push(&base)).await,
    Err(DeliveryError::Unreachable(_))
  ));
  assert!(matches!(
    client.probe(&peer(&base)).await,
    Err(ElectionError::Unreachable { peer: 2, .. })
  ));
}
