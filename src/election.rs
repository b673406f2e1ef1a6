//! Bully leader election over a fixed, numbered peer set.
//!
//! Peers are numbered `1..=K`; the highest live id wins. A node enters
//! [`ElectionState::Electing`] after a settle delay and probes every peer with a
//! greater id, all at once, each bounded by the probe timeout:
//!
//! - any greater peer answers healthy: the node becomes a follower;
//! - no greater peer answers (or the node already has the greatest id): the node
//!   becomes leader, tells every lower peer to step down and starts heartbeats.
//!
//! A leader only gives up leadership when a peer with a greater id claims it.
//! Followers periodically re-probe the greater peers and re-run the election if
//! all of them are gone. Leaders do not probe.
//!
//! The current [`LeaderState`] is published through a `watch` channel; every
//! leader-gated action reads it through a cheap [`LeaderHandle`].

use crate::schedule::RecurringTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Numeric identity of a peer, `1..=K`.
pub type PeerId = u32;

/// Election configuration.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
  /// Wait before the first election after start.
  pub settle_delay: Duration,
  /// Bound on a single liveness probe.
  pub probe_timeout: Duration,
  /// Bound on a single step-down announcement.
  pub step_down_timeout: Duration,
  /// Leader heartbeat period.
  pub heartbeat_interval: Duration,
  /// Follower liveness check period.
  pub liveness_interval: Duration,
}

impl Default for ElectionConfig {
  fn default() -> Self {
    Self {
      settle_delay: Duration::from_secs(3),
      probe_timeout: Duration::from_secs(2),
      step_down_timeout: Duration::from_secs(1),
      heartbeat_interval: Duration::from_secs(30),
      liveness_interval: Duration::from_secs(10),
    }
  }
}

impl ElectionConfig {
  /// Sets the settle delay.
  #[must_use]
  pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
    self.settle_delay = settle_delay;
    self
  }

  /// Sets the probe timeout.
  #[must_use]
  pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
    self.probe_timeout = probe_timeout;
    self
  }

  /// Sets the follower liveness check period.
  #[must_use]
  pub fn with_liveness_interval(mut self, liveness_interval: Duration) -> Self {
    self.liveness_interval = liveness_interval;
    self
  }
}

/// Election errors.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
  /// The own id is outside the configured peer set.
  #[error("node id {self_id} is outside peer set 1..={count}")]
  InvalidPeerSet {
    /// Own id.
    self_id: PeerId,
    /// Configured peer count.
    count: u32,
  },

  /// A peer could not be reached.
  #[error("peer {peer} unreachable: {reason}")]
  Unreachable {
    /// Peer id.
    peer: PeerId,
    /// Transport error.
    reason: String,
  },

  /// A peer answered but reported itself unhealthy.
  #[error("peer {peer} unhealthy")]
  Unhealthy {
    /// Peer id.
    peer: PeerId,
  },

  /// A probe or announcement exceeded its timeout.
  #[error("peer {peer} timed out")]
  Timeout {
    /// Peer id.
    peer: PeerId,
  },
}

/// A member of the static peer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerNode {
  /// Numeric identity.
  pub numeric_id: PeerId,
  /// Base URL of the peer's HTTP surface.
  pub health_endpoint: String,
  /// Last time a probe found the peer healthy.
  pub last_known_alive: Option<DateTime<Utc>>,
}

/// The fixed peer set `1..=count` as seen from one node.
#[derive(Debug, Clone)]
pub struct PeerSet {
  self_id: PeerId,
  count: u32,
  host: String,
  base_port: u16,
}

impl PeerSet {
  /// Creates the peer set; peer `n` listens on `base_port + n - 1`.
  pub fn new(
    self_id: PeerId,
    count: u32,
    host: impl Into<String>,
    base_port: u16,
  ) -> Result<Self, ElectionError> {
    if self_id == 0 || self_id > count {
      return Err(ElectionError::InvalidPeerSet { self_id, count });
    }
    Ok(Self {
      self_id,
      count,
      host: host.into(),
      base_port,
    })
  }

  /// Returns the own id.
  pub fn self_id(&self) -> PeerId {
    self.self_id
  }

  /// Returns the peer count.
  pub fn count(&self) -> u32 {
    self.count
  }

  /// Returns the base URL of peer `id`.
  pub fn address_of(&self, id: PeerId) -> String {
    let port = u32::from(self.base_port) + id - 1;
    format!("http://{}:{}", self.host, port)
  }

  /// Returns the ids strictly greater than the own id.
  pub fn higher(&self) -> impl Iterator<Item = PeerId> + '_ {
    (self.self_id + 1)..=self.count
  }

  /// Returns the ids strictly lower than the own id.
  pub fn lower(&self) -> impl Iterator<Item = PeerId> + '_ {
    1..self.self_id
  }

  /// Returns every id except the own one.
  pub fn others(&self) -> impl Iterator<Item = PeerId> + '_ {
    (1..=self.count).filter(move |id| *id != self.self_id)
  }

  /// Returns true if the own id is the greatest in the set.
  pub fn is_highest(&self) -> bool {
    self.self_id == self.count
  }
}

/// Phase of the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionState {
  /// Probing greater peers.
  Electing,
  /// This node coordinates the cluster.
  Leader,
  /// Another node coordinates the cluster.
  Follower,
}

impl fmt::Display for ElectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ElectionState::Electing => write!(f, "electing"),
      ElectionState::Leader => write!(f, "leader"),
      ElectionState::Follower => write!(f, "follower"),
    }
  }
}

/// Leadership as known by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderState {
  /// State machine phase.
  pub state: ElectionState,
  /// The known leader, if any.
  pub current_leader_id: Option<PeerId>,
  /// True when this node is the leader.
  pub is_self_leader: bool,
}

impl LeaderState {
  fn electing() -> Self {
    Self {
      state: ElectionState::Electing,
      current_leader_id: None,
      is_self_leader: false,
    }
  }

  fn leader(self_id: PeerId) -> Self {
    Self {
      state: ElectionState::Leader,
      current_leader_id: Some(self_id),
      is_self_leader: true,
    }
  }

  fn follower(leader: Option<PeerId>) -> Self {
    Self {
      state: ElectionState::Follower,
      current_leader_id: leader,
      is_self_leader: false,
    }
  }
}

/// Read-only view of a node's leadership.
#[derive(Debug, Clone)]
pub struct LeaderHandle {
  rx: watch::Receiver<LeaderState>,
}

impl LeaderHandle {
  /// Returns a handle that always reports `state`. Used where no elector runs.
  pub fn fixed(state: LeaderState) -> Self {
    let (_tx, rx) = watch::channel(state);
    Self { rx }
  }

  /// Returns a handle that always reports this node as leader.
  pub fn always_leader(self_id: PeerId) -> Self {
    Self::fixed(LeaderState::leader(self_id))
  }

  /// Returns the current state.
  pub fn state(&self) -> LeaderState {
    self.rx.borrow().clone()
  }

  /// Returns true while this node leads.
  pub fn is_leader(&self) -> bool {
    self.rx.borrow().is_self_leader
  }

  /// Returns the known leader id.
  pub fn current_leader(&self) -> Option<PeerId> {
    self.rx.borrow().current_leader_id
  }

  /// Waits until `pred` holds for the published state and returns it.
  ///
  /// Returns `None` if the elector is gone.
  pub async fn wait_for(&mut self, pred: impl Fn(&LeaderState) -> bool) -> Option<LeaderState> {
    self.rx.wait_for(|s| pred(s)).await.ok().map(|s| s.clone())
  }
}

/// Transport used by the elector to reach peers.
#[async_trait]
pub trait PeerClient: Send + Sync {
  /// Checks that `peer` is alive and healthy.
  async fn probe(&self, peer: &PeerNode) -> Result<(), ElectionError>;

  /// Tells `peer` that `claimant` has taken leadership.
  async fn step_down(&self, peer: &PeerNode, claimant: PeerId) -> Result<(), ElectionError>;
}

struct ElectorInner {
  peers: PeerSet,
  client: Arc<dyn PeerClient>,
  config: ElectionConfig,
  state: watch::Sender<LeaderState>,
  last_alive: Mutex<HashMap<PeerId, DateTime<Utc>>>,
  election: tokio::sync::Mutex<()>,
}

/// Background tasks of a started elector.
pub struct ElectorTasks {
  first_election: tokio::task::JoinHandle<()>,
  heartbeat: RecurringTask,
  liveness: RecurringTask,
}

impl ElectorTasks {
  /// Stops every task.
  pub async fn stop(self) {
    self.first_election.abort();
    self.heartbeat.stop().await;
    self.liveness.stop().await;
  }
}

/// Runs the Bully election for one node.
#[derive(Clone)]
pub struct LeaderElector {
  inner: Arc<ElectorInner>,
}

impl LeaderElector {
  /// Creates an elector in the [`ElectionState::Electing`] state.
  pub fn new(peers: PeerSet, client: Arc<dyn PeerClient>, config: ElectionConfig) -> Self {
    let (state, _) = watch::channel(LeaderState::electing());
    Self {
      inner: Arc::new(ElectorInner {
        peers,
        client,
        config,
        state,
        last_alive: Mutex::new(HashMap::new()),
        election: tokio::sync::Mutex::new(()),
      }),
    }
  }

  /// Returns the own id.
  pub fn self_id(&self) -> PeerId {
    self.inner.peers.self_id()
  }

  /// Returns the peer set.
  pub fn peer_set(&self) -> &PeerSet {
    &self.inner.peers
  }

  /// Returns a read-only handle on the leadership state.
  pub fn handle(&self) -> LeaderHandle {
    LeaderHandle {
      rx: self.inner.state.subscribe(),
    }
  }

  /// Returns the current state.
  pub fn state(&self) -> LeaderState {
    self.inner.state.borrow().clone()
  }

  /// Returns true while this node leads.
  pub fn is_leader(&self) -> bool {
    self.inner.state.borrow().is_self_leader
  }

  /// Returns every other peer with its last known liveness.
  pub fn peer_nodes(&self) -> Vec<PeerNode> {
    let alive = self.inner.last_alive.lock().unwrap_or_else(|e| e.into_inner());
    self
      .inner
      .peers
      .others()
      .map(|id| PeerNode {
        numeric_id: id,
        health_endpoint: self.inner.peers.address_of(id),
        last_known_alive: alive.get(&id).copied(),
      })
      .collect()
  }

  fn peer_node(&self, id: PeerId) -> PeerNode {
    PeerNode {
      numeric_id: id,
      health_endpoint: self.inner.peers.address_of(id),
      last_known_alive: None,
    }
  }

  /// Probes every greater peer concurrently and returns the ids that answered.
  async fn probe_higher(&self) -> Vec<PeerId> {
    let timeout = self.inner.config.probe_timeout;
    let probes = self.inner.peers.higher().map(|id| {
      let peer = self.peer_node(id);
      let client = Arc::clone(&self.inner.client);
      async move {
        let outcome = match tokio::time::timeout(timeout, client.probe(&peer)).await {
          Ok(result) => result,
          Err(_) => Err(ElectionError::Timeout { peer: id }),
        };
        (id, outcome)
      }
    });

    let mut alive = Vec::new();
    for (id, outcome) in join_all(probes).await {
      match outcome {
        Ok(()) => {
          self
            .inner
            .last_alive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Utc::now());
          alive.push(id);
        }
        Err(e) => debug!(node = self.self_id(), peer = id, error = %e, "peer considered down"),
      }
    }
    alive
  }

  /// Runs one election round and returns the resulting state.
  ///
  /// Rounds on one node never overlap. A step-down accepted while the round is
  /// probing wins over the round's own conclusion.
  pub async fn run_election(&self) -> ElectionState {
    let _round = self.inner.election.lock().await;
    let self_id = self.self_id();
    self.inner.state.send_replace(LeaderState::electing());
    info!(node = self_id, "starting leader election");

    if !self.inner.peers.is_highest() {
      let alive = self.probe_higher().await;
      if let Some(leader) = alive.iter().copied().max() {
        let concluded = self.conclude(LeaderState::follower(Some(leader)));
        info!(node = self_id, leader, "greater peer alive, following");
        crate::metrics::record_election(self_id, false);
        return concluded;
      }
    }

    let concluded = self.conclude(LeaderState::leader(self_id));
    if concluded == ElectionState::Leader {
      info!(node = self_id, "elected leader");
      crate::metrics::record_election(self_id, true);
      self.announce_leadership().await;
    }
    concluded
  }

  /// Publishes `next` unless a step-down already moved the state on.
  fn conclude(&self, next: LeaderState) -> ElectionState {
    let mut result = next.state;
    self.inner.state.send_modify(|state| {
      if state.state == ElectionState::Electing {
        *state = next;
      } else {
        result = state.state;
      }
    });
    result
  }

  /// Tells every lower peer to step down; failures are only logged.
  async fn announce_leadership(&self) {
    let self_id = self.self_id();
    let timeout = self.inner.config.step_down_timeout;
    let announcements = self.inner.peers.lower().map(|id| {
      let peer = self.peer_node(id);
      let client = Arc::clone(&self.inner.client);
      async move {
        let outcome = match tokio::time::timeout(timeout, client.step_down(&peer, self_id)).await {
          Ok(result) => result,
          Err(_) => Err(ElectionError::Timeout { peer: id }),
        };
        (id, outcome)
      }
    });
    for (id, outcome) in join_all(announcements).await {
      if let Err(e) = outcome {
        warn!(node = self_id, peer = id, error = %e, "step-down announcement failed");
      }
    }
  }

  /// Handles a step-down directive from `claimant`.
  ///
  /// Only a claimant with a greater id inside the peer set is accepted.
  /// Returns whether it was.
  pub fn handle_step_down(&self, claimant: PeerId) -> bool {
    let self_id = self.self_id();
    if claimant <= self_id {
      debug!(node = self_id, claimant, "ignoring step-down from lesser or equal id");
      return false;
    }
    if claimant > self.peer_set().count() {
      warn!(
        node = self_id,
        claimant,
        peers = self.peer_set().count(),
        "ignoring step-down from id outside the peer set"
      );
      return false;
    }
    let was_leader = self.inner.state.borrow().is_self_leader;
    self.inner.state.send_replace(LeaderState::follower(Some(claimant)));
    if was_leader {
      info!(node = self_id, claimant, "stepping down");
      crate::metrics::record_step_down(self_id);
    } else {
      debug!(node = self_id, claimant, "following announced leader");
    }
    true
  }

  /// Follower liveness check: re-runs the election if no greater peer answers.
  ///
  /// Does nothing on a leader or while an election is in progress.
  pub async fn check_liveness(&self) {
    if self.inner.state.borrow().state != ElectionState::Follower {
      return;
    }
    let alive = self.probe_higher().await;
    match alive.iter().copied().max() {
      Some(leader) => {
        self.inner.state.send_if_modified(|state| {
          if state.state == ElectionState::Follower && state.current_leader_id != Some(leader) {
            state.current_leader_id = Some(leader);
            true
          } else {
            false
          }
        });
      }
      None => {
        warn!(node = self.self_id(), "no greater peer answered, re-running election");
        self.run_election().await;
      }
    }
  }

  /// Leader heartbeat; a no-op on followers.
  pub fn heartbeat(&self) {
    if self.is_leader() {
      info!(node = self.self_id(), "leader heartbeat");
      crate::metrics::record_leader_heartbeat(self.self_id());
    }
  }

  /// Starts the first election after the settle delay, the leader heartbeat
  /// and the follower liveness check.
  pub fn start(&self) -> ElectorTasks {
    let config = &self.inner.config;

    let elector = self.clone();
    let settle_delay = config.settle_delay;
    let first_election = tokio::spawn(async move {
      tokio::time::sleep(settle_delay).await;
      elector.run_election().await;
    });

    let elector = self.clone();
    let heartbeat = RecurringTask::start("leader-heartbeat", config.heartbeat_interval, move || {
      let elector = elector.clone();
      async move { elector.heartbeat() }
    });

    let elector = self.clone();
    let liveness = RecurringTask::start_after(
      "follower-liveness",
      config.settle_delay + config.liveness_interval,
      config.liveness_interval,
      move || {
        let elector = elector.clone();
        async move { elector.check_liveness().await }
      },
    );

    ElectorTasks {
      first_election,
      heartbeat,
      liveness,
    }
  }
}
