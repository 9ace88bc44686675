//! Fan-out of ingested entries to live stream subscribers, with a
//! hub-global backpressure strategy, per-subscriber drop accounting, and
//! heartbeat policy constants shared with the connection loops.

mod subscriber;

pub use subscriber::Subscriber;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::models::stream::{LogEvent, ServerMessage};

/// Outbound queue capacity per subscriber.
pub const QUEUE_CAPACITY: usize = 256;
/// Bounded wait before dropping under the `queue` strategy.
pub const QUEUE_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(50);
/// Cadence of server heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A subscriber with no pong for longer than this is closed.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
/// Per-write deadline on the outbound socket.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureStrategy {
    #[default]
    Drop,
    Queue,
}

impl BackpressureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureStrategy::Drop => "drop",
            BackpressureStrategy::Queue => "queue",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub total_dropped: u64,
    pub backpressure_strategy: BackpressureStrategy,
    pub per_subscriber: Vec<SubscriberStats>,
}

#[derive(Debug, Serialize)]
pub struct SubscriberStats {
    pub id: u64,
    pub queue_len: usize,
    pub drops: u64,
    pub authenticated: bool,
    pub filters: HashMap<String, String>,
}

/// The streaming hub. Registration mutations go through the inner lock;
/// fan-out snapshots the matching subscribers and enqueues without holding
/// it.
pub struct Hub {
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    strategy: RwLock<BackpressureStrategy>,
    total_dropped: AtomicU64,
    next_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Hub {
            subscribers: RwLock::new(HashMap::new()),
            strategy: RwLock::new(BackpressureStrategy::Drop),
            total_dropped: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_subscriber_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a subscriber to the active set. Idempotent per id.
    pub fn register(&self, sub: Arc<Subscriber>) {
        let count = {
            let mut subs = self.subscribers.write().unwrap();
            subs.insert(sub.id, sub);
            subs.len()
        };
        tracing::debug!("hub: subscriber registered ({count} active)");
    }

    /// Remove and cancel a subscriber. Idempotent.
    pub fn unregister(&self, id: u64) {
        let removed = self.subscribers.write().unwrap().remove(&id);
        if let Some(sub) = removed {
            sub.cancel();
            tracing::debug!("hub: subscriber {id} unregistered");
        }
    }

    pub fn set_strategy(&self, strategy: BackpressureStrategy) {
        *self.strategy.write().unwrap() = strategy;
        tracing::info!("hub: backpressure strategy set to {}", strategy.as_str());
    }

    pub fn strategy(&self) -> BackpressureStrategy {
        *self.strategy.read().unwrap()
    }

    /// Deliver one event to every subscriber whose filters match. Slow
    /// subscribers cost a bounded wait at most; a full queue means the
    /// event is dropped for that subscriber and counted.
    pub async fn publish(&self, event: &LogEvent) {
        let matched: Vec<Arc<Subscriber>> = {
            let subs = self.subscribers.read().unwrap();
            subs.values()
                .filter(|sub| sub.matches(event))
                .cloned()
                .collect()
        };
        if matched.is_empty() {
            return;
        }

        let strategy = self.strategy();
        for sub in matched {
            let msg = ServerMessage::Log {
                event: event.clone(),
            };
            let delivered = match strategy {
                BackpressureStrategy::Drop => sub.try_enqueue(msg).is_ok(),
                BackpressureStrategy::Queue => {
                    sub.enqueue_within(msg, QUEUE_ENQUEUE_TIMEOUT).await.is_ok()
                }
            };
            if !delivered {
                let drops = sub.record_drop();
                let total = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "hub: dropped event {} for subscriber {} (sub drops={drops}, total={total})",
                    event.id,
                    sub.id,
                );
            }
        }
    }

    pub fn stats(&self) -> HubStats {
        let subs = self.subscribers.read().unwrap();
        let mut per_subscriber: Vec<SubscriberStats> = subs
            .values()
            .map(|sub| SubscriberStats {
                id: sub.id,
                queue_len: sub.queue_len(),
                drops: sub.drops(),
                authenticated: sub.is_authenticated(),
                filters: sub.filters(),
            })
            .collect();
        per_subscriber.sort_by_key(|s| s.id);
        HubStats {
            subscribers: subs.len(),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            backpressure_strategy: self.strategy(),
            per_subscriber,
        }
    }
}
