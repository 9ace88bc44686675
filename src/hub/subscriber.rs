use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

use super::QUEUE_CAPACITY;
use crate::auth::Session;
use crate::error::{Error, Result};
use crate::models::stream::{LogEvent, ServerMessage};

/// Filter keys a subscriber may set. Unknown keys are rejected at update
/// time.
const ALLOWED_FILTER_KEYS: [&str; 4] = ["service", "level", "message", "correlation_id"];

/// Per-connection state tracked by the hub. Ephemeral: lives exactly as
/// long as the registration.
pub struct Subscriber {
    pub id: u64,
    tx: mpsc::Sender<ServerMessage>,
    filters: RwLock<HashMap<String, String>>,
    session: RwLock<Option<Session>>,
    last_pong_ms: AtomicI64,
    drops: AtomicU64,
    cancel: watch::Sender<bool>,
}

impl Subscriber {
    /// Build a subscriber plus the receiving half of its outbound queue and
    /// its cancellation signal.
    pub fn new(
        id: u64,
        filters: HashMap<String, String>,
    ) -> (
        std::sync::Arc<Self>,
        mpsc::Receiver<ServerMessage>,
        watch::Receiver<bool>,
    ) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (cancel, cancelled) = watch::channel(false);
        let sub = std::sync::Arc::new(Subscriber {
            id,
            tx,
            filters: RwLock::new(filters),
            session: RwLock::new(None),
            last_pong_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            drops: AtomicU64::new(0),
            cancel,
        });
        (sub, rx, cancelled)
    }

    /// An event matches when every filter key equals the event's field,
    /// case-sensitively. An empty filter matches everything.
    pub fn matches(&self, event: &LogEvent) -> bool {
        let filters = self.filters.read().unwrap();
        filters
            .iter()
            .all(|(key, expected)| event.field(key) == Some(expected.as_str()))
    }

    /// Atomically replace the filter map. Keys are validated first; on any
    /// unknown key the whole update is rejected and the old map stays.
    pub fn replace_filters(&self, filters: HashMap<String, String>) -> Result<()> {
        for key in filters.keys() {
            if !ALLOWED_FILTER_KEYS.contains(&key.as_str()) {
                return Err(Error::validation(format!("unknown filter field {key:?}")));
            }
        }
        *self.filters.write().unwrap() = filters;
        Ok(())
    }

    pub fn filters(&self) -> HashMap<String, String> {
        self.filters.read().unwrap().clone()
    }

    pub fn try_enqueue(&self, msg: ServerMessage) -> Result<()> {
        self.tx.try_send(msg).map_err(|_| Error::Backpressure)
    }

    pub async fn enqueue_within(
        &self,
        msg: ServerMessage,
        deadline: std::time::Duration,
    ) -> Result<()> {
        match tokio::time::timeout(deadline, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::Backpressure),
        }
    }

    pub fn record_drop(&self) -> u64 {
        self.drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        QUEUE_CAPACITY - self.tx.capacity()
    }

    pub fn record_pong(&self) {
        self.last_pong_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// True when no pong has been seen within the timeout.
    pub fn heartbeat_expired(&self, timeout: std::time::Duration) -> bool {
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        let age_ms = Utc::now().timestamp_millis() - last;
        age_ms > timeout.as_millis() as i64
    }

    pub fn set_session(&self, session: Session) {
        *self.session.write().unwrap() = Some(session);
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().unwrap().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.read().unwrap().is_some()
    }

    /// Abort both connection loops. Idempotent.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}
