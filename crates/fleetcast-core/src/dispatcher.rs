//! Position fan-out to subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing offers each event to
//! every queue with a non-blocking send, so a subscriber that stops reading
//! only loses its own events. Subscribers that keep failing are evicted.

use dashmap::DashMap;
use fleetcast_protocol::PositionEvent;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{:x}", self.0)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-subscriber queue capacity, in events.
    pub queue_capacity: usize,
    /// Publish rounds in a row with dropped events before a subscriber is
    /// evicted.
    pub max_consecutive_failures: u32,
    /// Whether `join` returns the last-known position of every vehicle.
    pub snapshot_on_join: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_consecutive_failures: 3,
            snapshot_on_join: true,
        }
    }
}

/// Why a delivery to one subscriber failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryFailure {
    /// The subscriber's queue is full.
    QueueFull,
    /// The subscriber's receiver is gone.
    Disconnected,
}

struct SubscriberEntry {
    sender: mpsc::Sender<Arc<PositionEvent>>,
    consecutive_failures: u32,
}

/// A live subscription returned by [`Dispatcher::join`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    snapshot: Vec<Arc<PositionEvent>>,
    receiver: mpsc::Receiver<Arc<PositionEvent>>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Take the join-time snapshot, leaving it empty.
    pub fn take_snapshot(&mut self) -> Vec<Arc<PositionEvent>> {
        std::mem::take(&mut self.snapshot)
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the subscriber has been evicted or removed and
    /// its queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<PositionEvent>> {
        self.receiver.recv().await
    }

    /// Receive an event if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<PositionEvent>> {
        self.receiver.try_recv().ok()
    }
}

/// Outcome of one publish round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscribers the round was offered to.
    pub recipients: usize,
    /// Events enqueued across all subscribers.
    pub delivered: usize,
    /// Events dropped because a queue was full or closed.
    pub dropped: usize,
    /// Subscribers evicted during this round.
    pub evicted: usize,
}

/// Dispatcher statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Current subscribers.
    pub subscribers: usize,
    /// Vehicles with a last-known position.
    pub vehicles: usize,
    /// Subscribers evicted since start.
    pub evictions: u64,
    /// Events dropped since start.
    pub dropped: u64,
}

/// The broadcast dispatcher.
pub struct Dispatcher {
    subscribers: DashMap<SubscriberId, SubscriberEntry>,
    /// Last event per vehicle id.
    last_known: DashMap<String, Arc<PositionEvent>>,
    next_id: AtomicU64,
    evictions: AtomicU64,
    dropped: AtomicU64,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    /// Create a dispatcher with custom configuration.
    #[must_use]
    pub fn with_config(config: DispatcherConfig) -> Self {
        info!("Creating dispatcher with config: {:?}", config);
        Self {
            subscribers: DashMap::new(),
            last_known: DashMap::new(),
            next_id: AtomicU64::new(1),
            evictions: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Register a new subscriber.
    ///
    /// The subscriber receives every event published after this call. When
    /// snapshots are enabled, the returned subscription also carries the
    /// last-known event of every vehicle.
    pub fn join(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));

        // Register before reading the snapshot: anything published in
        // between shows up in both, never in neither.
        self.subscribers.insert(
            id,
            SubscriberEntry {
                sender,
                consecutive_failures: 0,
            },
        );

        let snapshot = if self.config.snapshot_on_join {
            self.snapshot()
        } else {
            Vec::new()
        };

        debug!(
            subscriber = %id,
            subscribers = self.subscribers.len(),
            snapshot = snapshot.len(),
            "Subscriber joined"
        );

        Subscription {
            id,
            snapshot,
            receiver,
        }
    }

    /// Remove a subscriber.
    ///
    /// Returns `true` if the subscriber was registered.
    pub fn leave(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            debug!(
                subscriber = %id,
                subscribers = self.subscribers.len(),
                "Subscriber left"
            );
        }
        removed
    }

    /// Publish a batch of events to every subscriber.
    ///
    /// Never blocks and never fails; delivery problems are confined to the
    /// subscriber they occur on.
    pub fn publish(&self, events: &[Arc<PositionEvent>]) -> DispatchReport {
        if events.is_empty() {
            return DispatchReport::default();
        }

        for event in events {
            self.last_known
                .insert(event.vehicle_id.clone(), Arc::clone(event));
        }

        let mut report = DispatchReport::default();
        let mut evict = Vec::new();

        for mut entry in self.subscribers.iter_mut() {
            report.recipients += 1;
            let mut failure = None;

            for (i, event) in events.iter().enumerate() {
                match entry.sender.try_send(Arc::clone(event)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        report.dropped += 1;
                        failure = Some(DeliveryFailure::QueueFull);
                    }
                    Err(TrySendError::Closed(_)) => {
                        report.dropped += events.len() - i;
                        failure = Some(DeliveryFailure::Disconnected);
                        break;
                    }
                }
            }

            match failure {
                None => entry.consecutive_failures = 0,
                Some(DeliveryFailure::QueueFull) => {
                    entry.consecutive_failures += 1;
                    trace!(
                        subscriber = %entry.key(),
                        failures = entry.consecutive_failures,
                        "Subscriber queue full"
                    );
                    if entry.consecutive_failures >= self.config.max_consecutive_failures {
                        evict.push((*entry.key(), DeliveryFailure::QueueFull));
                    }
                }
                Some(DeliveryFailure::Disconnected) => {
                    evict.push((*entry.key(), DeliveryFailure::Disconnected));
                }
            }
        }

        // Removal must wait until the iterator has released its shard locks.
        for (id, reason) in evict {
            if self.subscribers.remove(&id).is_some() {
                report.evicted += 1;
                warn!(subscriber = %id, reason = ?reason, "Evicting subscriber");
            }
        }

        self.dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);

        trace!(
            events = events.len(),
            recipients = report.recipients,
            delivered = report.delivered,
            dropped = report.dropped,
            "Published batch"
        );

        report
    }

    /// Forget a vehicle's last-known position.
    pub fn forget(&self, vehicle_id: &str) -> bool {
        self.last_known.remove(vehicle_id).is_some()
    }

    /// Last-known event of every vehicle, sorted by vehicle id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<PositionEvent>> {
        let mut events: Vec<_> = self
            .last_known
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        events.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        events
    }

    /// Check if a subscriber is registered.
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Get dispatcher statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            subscribers: self.subscribers.len(),
            vehicles: self.last_known.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
