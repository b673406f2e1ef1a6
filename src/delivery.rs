//! Best-effort reliable push delivery with linear backoff.
//!
//! [`ReliableDeliveryQueue`] wraps a [`DeliveryTransport`] (a realtime socket
//! layer, or the peer HTTP client for replication) with a retry policy:
//!
//! - every send registers a [`PendingMessage`] and is attempted on its own task;
//! - a failed attempt `n` is retried after `n × base_delay`;
//! - after `max_attempts` failed attempts the message is dropped and a
//!   [`DeliveryEvent::Dropped`] is broadcast. The caller never sees the failure;
//! - entries leave the queue on acknowledgment, on drop, or once they are older
//!   than the grace window, whatever their outcome.
//!
//! This is fire-and-forget with retries, not guaranteed delivery.
//!
//! [`ReliableEmitter`] sits on top of the queue and is what business code uses:
//! it stamps each event with the node's Lamport time before fanning it out to
//! the destinations picked by a [`DestinationSelector`].

use crate::schedule::RecurringTask;
use crate::time::{LamportClock, LogicalTime, WallClock};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Identifier of a queued message.
pub type MessageId = String;

/// Retry policy of a [`ReliableDeliveryQueue`].
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
  /// Total delivery attempts before a message is dropped.
  pub max_attempts: u32,
  /// Backoff unit; the wait after failed attempt `n` is `n × base_delay`.
  pub base_delay: Duration,
  /// Age after which an entry is purged whatever its outcome.
  pub grace_window: Duration,
  /// How often the sweeper purges expired entries.
  pub sweep_interval: Duration,
  /// Capacity of the lifecycle event channel.
  pub event_capacity: usize,
}

impl Default for DeliveryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
      grace_window: Duration::from_secs(300),
      sweep_interval: Duration::from_secs(60),
      event_capacity: 256,
    }
  }
}

impl DeliveryConfig {
  /// Sets the total attempt cap.
  #[must_use]
  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  /// Sets the backoff unit.
  #[must_use]
  pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
    self.base_delay = base_delay;
    self
  }

  /// Sets the grace window.
  #[must_use]
  pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
    self.grace_window = grace_window;
    self
  }
}

/// Errors a transport reports for a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
  /// The destination is not connected or cannot be reached.
  #[error("destination unreachable: {0}")]
  Unreachable(String),
  /// The destination answered but refused the message.
  #[error("delivery rejected: {0}")]
  Rejected(String),
  /// The attempt did not complete in time.
  #[error("delivery timed out")]
  Timeout,
  /// Other transport error.
  #[error("delivery error: {0}")]
  Other(String),
}

/// What a transport knows after a successful attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryReceipt {
  /// Handed to the recipient channel; the recipient may still acknowledge later.
  Sent,
  /// The recipient acknowledged synchronously; nothing left to wait for.
  Acknowledged,
}

/// A message as handed to the transport for one attempt.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
  /// Message identifier, echoed back by recipients when they acknowledge.
  pub id: MessageId,
  /// Recipient channel.
  pub destination: String,
  /// Event name.
  pub event: String,
  /// Event payload.
  pub payload: Value,
  /// 1-based attempt number.
  pub attempt: u32,
}

/// Channel that actually moves messages to a recipient.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
  /// Makes one delivery attempt.
  async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError>;
}

/// A message registered with the queue.
#[derive(Clone, Debug)]
pub struct PendingMessage {
  /// Message identifier.
  pub id: MessageId,
  /// Recipient channel.
  pub destination: String,
  /// Event name.
  pub event: String,
  /// Event payload.
  pub payload: Value,
  /// Attempts made so far.
  pub attempts: u32,
  /// When the message was registered.
  pub created_at: Instant,
  /// True once an attempt succeeded.
  pub delivered: bool,
}

/// Lifecycle notifications broadcast by the queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryEvent {
  /// An attempt succeeded.
  Delivered {
    /// Message identifier.
    id: MessageId,
    /// Recipient channel.
    destination: String,
    /// Attempts it took.
    attempts: u32,
  },
  /// An attempt failed and another one is scheduled.
  Retrying {
    /// Message identifier.
    id: MessageId,
    /// The attempt that failed.
    attempt: u32,
    /// Wait before the next attempt.
    delay: Duration,
  },
  /// The attempt cap was reached; the message is gone.
  Dropped {
    /// Message identifier.
    id: MessageId,
    /// Recipient channel.
    destination: String,
    /// Event name.
    event: String,
    /// Attempts made.
    attempts: u32,
    /// Last transport error.
    reason: String,
  },
  /// The recipient acknowledged the message.
  Acknowledged {
    /// Message identifier.
    id: MessageId,
  },
  /// The entry outlived the grace window and was purged.
  Expired {
    /// Message identifier.
    id: MessageId,
  },
}

struct QueueInner {
  transport: Arc<dyn DeliveryTransport>,
  config: DeliveryConfig,
  pending: Mutex<HashMap<MessageId, PendingMessage>>,
  events: broadcast::Sender<DeliveryEvent>,
}

impl QueueInner {
  fn pending(&self) -> MutexGuard<'_, HashMap<MessageId, PendingMessage>> {
    self.pending.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn publish(&self, event: DeliveryEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }
}

/// Retry/backoff wrapper around a [`DeliveryTransport`].
#[derive(Clone)]
pub struct ReliableDeliveryQueue {
  inner: Arc<QueueInner>,
}

impl ReliableDeliveryQueue {
  /// Creates a queue over `transport`.
  pub fn new(transport: Arc<dyn DeliveryTransport>, config: DeliveryConfig) -> Self {
    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    Self {
      inner: Arc::new(QueueInner {
        transport,
        config,
        pending: Mutex::new(HashMap::new()),
        events,
      }),
    }
  }

  /// Returns the queue configuration.
  pub fn config(&self) -> &DeliveryConfig {
    &self.inner.config
  }

  /// Subscribes to lifecycle events.
  pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
    self.inner.events.subscribe()
  }

  /// Registers a message and starts delivering it in the background.
  ///
  /// Returns the message id immediately. Must be called from within a tokio
  /// runtime. Reusing the id of a message still pending replaces it.
  pub fn send(
    &self,
    destination: impl Into<String>,
    event: impl Into<String>,
    payload: Value,
    id: Option<MessageId>,
  ) -> MessageId {
    let id = id.unwrap_or_else(|| crate::id::generate("msg"));
    let message = PendingMessage {
      id: id.clone(),
      destination: destination.into(),
      event: event.into(),
      payload,
      attempts: 0,
      created_at: Instant::now(),
      delivered: false,
    };
    debug!(id = %id, destination = %message.destination, event = %message.event, "queued message");
    let count = {
      let mut pending = self.inner.pending();
      pending.insert(id.clone(), message);
      pending.len()
    };
    crate::metrics::record_pending_messages(count);

    let inner = Arc::clone(&self.inner);
    let task_id = id.clone();
    tokio::spawn(async move { deliver_until_done(inner, task_id).await });
    id
  }

  /// Removes a message early because its recipient acknowledged it.
  ///
  /// Returns false when the id is unknown (already purged, dropped or acked).
  pub fn acknowledge(&self, id: &str) -> bool {
    let removed = self.inner.pending().remove(id).is_some();
    if removed {
      debug!(id = %id, "message acknowledged");
      self.inner.publish(DeliveryEvent::Acknowledged { id: id.to_string() });
    }
    removed
  }

  /// Returns a copy of a pending message.
  pub fn pending(&self, id: &str) -> Option<PendingMessage> {
    self.inner.pending().get(id).cloned()
  }

  /// Returns the number of messages still held by the queue.
  pub fn pending_count(&self) -> usize {
    self.inner.pending().len()
  }

  /// Purges entries older than the grace window, whatever their outcome.
  ///
  /// Returns how many entries were removed.
  pub fn purge_expired(&self) -> usize {
    let grace = self.inner.config.grace_window;
    let now = Instant::now();
    let expired: Vec<MessageId> = {
      let mut pending = self.inner.pending();
      let expired: Vec<MessageId> = pending
        .values()
        .filter(|m| now.duration_since(m.created_at) >= grace)
        .map(|m| m.id.clone())
        .collect();
      for id in &expired {
        pending.remove(id);
      }
      expired
    };
    for id in &expired {
      self.inner.publish(DeliveryEvent::Expired { id: id.clone() });
    }
    if !expired.is_empty() {
      debug!(count = expired.len(), "purged expired messages");
    }
    crate::metrics::record_pending_messages(self.pending_count());
    expired.len()
  }

  /// Starts the recurring task that purges expired entries.
  pub fn start_sweeper(&self) -> RecurringTask {
    let queue = self.clone();
    RecurringTask::start("delivery-sweeper", self.inner.config.sweep_interval, move || {
      let queue = queue.clone();
      async move {
        queue.purge_expired();
      }
    })
  }
}

async fn deliver_until_done(inner: Arc<QueueInner>, id: MessageId) {
  loop {
    // Take a snapshot of the entry; it may have been acked or purged meanwhile.
    let outbound = {
      let mut pending = inner.pending();
      let Some(message) = pending.get_mut(&id) else {
        return;
      };
      message.attempts += 1;
      OutboundMessage {
        id: message.id.clone(),
        destination: message.destination.clone(),
        event: message.event.clone(),
        payload: message.payload.clone(),
        attempt: message.attempts,
      }
    };

    match inner.transport.deliver(&outbound).await {
      Ok(receipt) => {
        {
          let mut pending = inner.pending();
          match receipt {
            DeliveryReceipt::Acknowledged => {
              pending.remove(&id);
            }
            DeliveryReceipt::Sent => {
              if let Some(message) = pending.get_mut(&id) {
                message.delivered = true;
              }
            }
          }
        }
        crate::metrics::record_delivery_succeeded(&outbound.event, outbound.attempt);
        inner.publish(DeliveryEvent::Delivered {
          id: outbound.id,
          destination: outbound.destination,
          attempts: outbound.attempt,
        });
        return;
      }
      Err(e) if outbound.attempt >= inner.config.max_attempts => {
        inner.pending().remove(&id);
        error!(
          id = %outbound.id,
          destination = %outbound.destination,
          event = %outbound.event,
          attempts = outbound.attempt,
          error = %e,
          "dropping message after exhausting delivery attempts"
        );
        crate::metrics::record_delivery_dropped(&outbound.event);
        inner.publish(DeliveryEvent::Dropped {
          id: outbound.id,
          destination: outbound.destination,
          event: outbound.event,
          attempts: outbound.attempt,
          reason: e.to_string(),
        });
        return;
      }
      Err(e) => {
        let delay = inner.config.base_delay * outbound.attempt;
        info!(
          id = %outbound.id,
          attempt = outbound.attempt,
          delay_ms = delay.as_millis() as u64,
          error = %e,
          "delivery attempt failed, retrying"
        );
        inner.publish(DeliveryEvent::Retrying {
          id: outbound.id,
          attempt: outbound.attempt,
          delay,
        });
        tokio::time::sleep(delay).await;
      }
    }
  }
}

/// Transport that writes each message to the log and reports it sent.
///
/// Stands in for a recipient channel when the business layer registers none.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTransport;

#[async_trait]
impl DeliveryTransport for TracingTransport {
  async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
    info!(
      id = %message.id,
      destination = %message.destination,
      event = %message.event,
      "event emitted"
    );
    Ok(DeliveryReceipt::Sent)
  }
}

/// Which recipients an emitted event goes to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DestinationSelector {
  /// A single recipient channel.
  One(String),
  /// An explicit list of recipient channels.
  Many(Vec<String>),
  /// A named group (room, role) resolved by the registered [`DestinationResolver`].
  Group(String),
}

/// Resolves group names to recipient channels; implemented by the business layer.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
  /// Returns the recipient channels currently in `group`.
  async fn resolve(&self, group: &str) -> Vec<String>;
}

/// Stamps events with logical time and pushes them through the queue.
#[derive(Clone)]
pub struct ReliableEmitter {
  queue: ReliableDeliveryQueue,
  clock: Arc<LamportClock>,
  wall_clock: Arc<dyn WallClock>,
  node_id: String,
  resolver: Option<Arc<dyn DestinationResolver>>,
}

impl ReliableEmitter {
  /// Creates an emitter for the node `node_id`.
  pub fn new(
    queue: ReliableDeliveryQueue,
    clock: Arc<LamportClock>,
    wall_clock: Arc<dyn WallClock>,
    node_id: impl Into<String>,
  ) -> Self {
    Self {
      queue,
      clock,
      wall_clock,
      node_id: node_id.into(),
      resolver: None,
    }
  }

  /// Registers the resolver used for [`DestinationSelector::Group`].
  pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  /// Returns the underlying queue.
  pub fn queue(&self) -> &ReliableDeliveryQueue {
    &self.queue
  }

  /// Emits `event` to every selected destination, fire-and-forget.
  ///
  /// The clock ticks once per emit; every recipient sees the same logical time.
  /// Returns the ids of the queued messages.
  pub async fn emit(
    &self,
    selector: DestinationSelector,
    event: &str,
    payload: Value,
  ) -> Vec<MessageId> {
    let destinations = match selector {
      DestinationSelector::One(destination) => vec![destination],
      DestinationSelector::Many(destinations) => destinations,
      DestinationSelector::Group(group) => match &self.resolver {
        Some(resolver) => resolver.resolve(&group).await,
        None => {
          warn!(group = %group, event = %event, "no destination resolver registered, event not sent");
          Vec::new()
        }
      },
    };

    let logical_time = self.clock.tick();
    let enriched = self.enrich(payload, logical_time);
    debug!(
      event = %event,
      lamport = %logical_time,
      recipients = destinations.len(),
      "emitting reliable event"
    );
    destinations
      .into_iter()
      .map(|destination| self.queue.send(destination, event, enriched.clone(), None))
      .collect()
  }

  fn enrich(&self, payload: Value, logical_time: LogicalTime) -> Value {
    let mut object = match payload {
      Value::Object(map) => map,
      other => {
        let mut map = Map::new();
        map.insert("data".to_string(), other);
        map
      }
    };
    object.insert("lamportTime".to_string(), Value::from(logical_time.as_u64()));
    object.insert(
      "timestamp".to_string(),
      Value::String(self.wall_clock.now().to_rfc3339()),
    );
    object.insert("nodeId".to_string(), Value::String(self.node_id.clone()));
    Value::Object(object)
  }
}
