//! Tests for the Bully election over a simulated network.

use crate::election::{
  ElectionConfig, ElectionError, ElectionState, LeaderElector, LeaderHandle, LeaderState,
  PeerClient, PeerId, PeerNode, PeerSet,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// In-process network: delivers probes and step-downs straight to electors.
#[derive(Default)]
struct SimNetwork {
  nodes: Mutex<HashMap<PeerId, Weak<LeaderElector>>>,
  down: Mutex<HashSet<PeerId>>,
  hanging: Mutex<HashSet<PeerId>>,
}

impl SimNetwork {
  fn disable(&self, id: PeerId) {
    self.down.lock().unwrap().insert(id);
  }

  fn hang(&self, id: PeerId) {
    self.hanging.lock().unwrap().insert(id);
  }

  fn target(&self, id: PeerId) -> Result<Arc<LeaderElector>, ElectionError> {
    if self.hanging.lock().unwrap().contains(&id) {
      return Err(ElectionError::Unhealthy { peer: id });
    }
    if self.down.lock().unwrap().contains(&id) {
      return Err(ElectionError::Unreachable {
        peer: id,
        reason: "connection refused".into(),
      });
    }
    self
      .nodes
      .lock()
      .unwrap()
      .get(&id)
      .and_then(Weak::upgrade)
      .ok_or(ElectionError::Unreachable {
        peer: id,
        reason: "no such node".into(),
      })
  }
}

#[async_trait]
impl PeerClient for SimNetwork {
  async fn probe(&self, peer: &PeerNode) -> Result<(), ElectionError> {
    if self.hanging.lock().unwrap().contains(&peer.numeric_id) {
      tokio::time::sleep(Duration::from_secs(3600)).await;
    }
    self.target(peer.numeric_id).map(|_| ())
  }

  async fn step_down(&self, peer: &PeerNode, claimant: PeerId) -> Result<(), ElectionError> {
    let target = self.target(peer.numeric_id)?;
    target.handle_step_down(claimant);
    Ok(())
  }
}

fn cluster(count: u32, config: ElectionConfig) -> (Arc<SimNetwork>, Vec<Arc<LeaderElector>>) {
  let network = Arc::new(SimNetwork::default());
  let electors: Vec<Arc<LeaderElector>> = (1..=count)
    .map(|id| {
      let peers = PeerSet::new(id, count, "127.0.0.1", 5000).unwrap();
      Arc::new(LeaderElector::new(peers, network.clone(), config.clone()))
    })
    .collect();
  for elector in &electors {
    network
      .nodes
      .lock()
      .unwrap()
      .insert(elector.self_id(), Arc::downgrade(elector));
  }
  (network, electors)
}

fn leaders(electors: &[Arc<LeaderElector>], network: &SimNetwork) -> Vec<PeerId> {
  let down = network.down.lock().unwrap().clone();
  electors
    .iter()
    .filter(|e| !down.contains(&e.self_id()) && e.is_leader())
    .map(|e| e.self_id())
    .collect()
}

#[test]
fn test_peer_set_addresses() {
  let peers = PeerSet::new(2, 4, "10.0.0.5", 5000).unwrap();
  assert_eq!(peers.address_of(1), "http://10.0.0.5:5000");
  assert_eq!(peers.address_of(4), "http://10.0.0.5:5003");
  assert_eq!(peers.higher().collect::<Vec<_>>(), vec![3, 4]);
  assert_eq!(peers.lower().collect::<Vec<_>>(), vec![1]);
  assert_eq!(peers.others().collect::<Vec<_>>(), vec![1, 3, 4]);
  assert!(!peers.is_highest());
}

#[test]
fn test_peer_set_rejects_out_of_range_id() {
  assert!(matches!(
    PeerSet::new(5, 4, "localhost", 5000),
    Err(ElectionError::InvalidPeerSet { self_id: 5, count: 4 })
  ));
  assert!(PeerSet::new(0, 4, "localhost", 5000).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_highest_healthy_peer_wins() {
  let (network, electors) = cluster(4, ElectionConfig::default());
  for elector in &electors {
    elector.run_election().await;
  }
  assert_eq!(leaders(&electors, &network), vec![4]);
  for elector in &electors[..3] {
    assert_eq!(elector.state().state, ElectionState::Follower);
    assert_eq!(elector.state().current_leader_id, Some(4));
  }
}

#[tokio::test(start_paused = true)]
async fn test_election_order_does_not_matter() {
  let (network, electors) = cluster(4, ElectionConfig::default());
  for elector in electors.iter().rev() {
    elector.run_election().await;
  }
  assert_eq!(leaders(&electors, &network), vec![4]);
}

#[tokio::test(start_paused = true)]
async fn test_next_highest_takes_over_when_leader_disappears() {
  let (network, electors) = cluster(4, ElectionConfig::default());
  for elector in &electors {
    elector.run_election().await;
  }
  network.disable(4);

  // One liveness cycle on every follower.
  for elector in &electors[..3] {
    elector.check_liveness().await;
  }
  assert_eq!(leaders(&electors, &network), vec![3]);
  assert_eq!(electors[0].state().current_leader_id, Some(3));
  assert_eq!(electors[1].state().current_leader_id, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_lesser_claimant_is_ignored() {
  let (network, electors) = cluster(3, ElectionConfig::default());
  for elector in &electors {
    elector.run_election().await;
  }
  assert_eq!(leaders(&electors, &network), vec![3]);

  assert!(!electors[2].handle_step_down(1));
  assert!(!electors[2].handle_step_down(3));
  assert!(electors[2].is_leader());
}

#[tokio::test(start_paused = true)]
async fn test_claimant_outside_peer_set_is_ignored() {
  let (network, electors) = cluster(3, ElectionConfig::default());
  for elector in &electors {
    elector.run_election().await;
  }
  assert!(!electors[2].handle_step_down(4));
  assert!(!electors[1].handle_step_down(99));
  assert_eq!(leaders(&electors, &network), vec![3]);
  assert_eq!(electors[1].state().current_leader_id, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_greater_claimant_demotes_leader() {
  let (network, electors) = cluster(4, ElectionConfig::default());
  network.disable(4);
  for elector in &electors[..3] {
    elector.run_election().await;
  }
  assert_eq!(leaders(&electors, &network), vec![3]);

  // Node 4 comes back and announces itself.
  network.down.lock().unwrap().clear();
  assert_eq!(electors[3].run_election().await, ElectionState::Leader);
  assert_eq!(leaders(&electors, &network), vec![4]);
  assert_eq!(electors[2].state().current_leader_id, Some(4));
}

#[tokio::test(start_paused = true)]
async fn test_probes_run_concurrently_and_time_out() {
  let config = ElectionConfig::default().with_probe_timeout(Duration::from_secs(2));
  let (network, electors) = cluster(4, config);
  for id in 2..=4 {
    network.hang(id);
  }

  let started = Instant::now();
  assert_eq!(electors[0].run_election().await, ElectionState::Leader);
  // Three unresponsive peers cost one timeout, not three.
  assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_probe_records_last_known_alive() {
  let (_network, electors) = cluster(3, ElectionConfig::default());
  electors[0].run_election().await;
  let nodes = electors[0].peer_nodes();
  assert_eq!(nodes.len(), 2);
  assert!(nodes.iter().all(|n| n.last_known_alive.is_some()));
  assert_eq!(nodes[1].health_endpoint, "http://127.0.0.1:5002");
}

#[tokio::test(start_paused = true)]
async fn test_start_elects_after_settle_delay() {
  let config = ElectionConfig::default().with_settle_delay(Duration::from_secs(3));
  let (_network, electors) = cluster(2, config);
  let tasks: Vec<_> = electors.iter().map(|e| e.start()).collect();

  let mut handle = electors[1].handle();
  assert_eq!(handle.state().state, ElectionState::Electing);

  tokio::time::sleep(Duration::from_secs(2)).await;
  assert!(!handle.is_leader());

  let state = handle.wait_for(|s| s.is_self_leader).await.unwrap();
  assert_eq!(state.current_leader_id, Some(2));

  tokio::time::sleep(Duration::from_secs(15)).await;
  assert!(electors[1].is_leader());
  assert!(!electors[0].is_leader());

  for task in tasks {
    task.stop().await;
  }
}

#[tokio::test(start_paused = true)]
async fn test_highest_follower_reelects_itself() {
  let (_network, electors) = cluster(2, ElectionConfig::default());
  electors[1].run_election().await;
  // A stale step-down leaves the highest node following someone else.
  electors[1].handle_step_down(3);
  assert!(!electors[1].is_leader());

  electors[1].check_liveness().await;
  assert!(electors[1].is_leader());
}

#[test]
fn test_fixed_handle_reports_state() {
  let handle = LeaderHandle::always_leader(7);
  assert!(handle.is_leader());
  assert_eq!(handle.current_leader(), Some(7));

  let follower = LeaderHandle::fixed(LeaderState {
    state: ElectionState::Follower,
    current_leader_id: Some(2),
    is_self_leader: false,
  });
  assert!(!follower.is_leader());
}
