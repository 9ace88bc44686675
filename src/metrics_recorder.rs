//! Request metrics side channel: handlers never block on metrics; a
//! background writer batches rows into `api_metrics`.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::AppState;
use crate::models::alert::ApiMetric;
use crate::store::Store;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const FLUSH_THRESHOLD: usize = 500;

/// Handle for recording request metrics (non-blocking, fire-and-forget).
#[derive(Clone)]
pub struct MetricsRecorder {
    tx: mpsc::UnboundedSender<ApiMetric>,
}

impl MetricsRecorder {
    pub fn record(&self, method: &str, path: &str, status: u16, duration_ms: i64) {
        let _ = self.tx.send(ApiMetric {
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration_ms,
            recorded_at: Utc::now(),
        });
    }
}

/// Spawn the background writer and return the recorder handle.
pub fn spawn(store: Arc<Store>) -> MetricsRecorder {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(metrics_writer(rx, store));
    MetricsRecorder { tx }
}

async fn metrics_writer(mut rx: mpsc::UnboundedReceiver<ApiMetric>, store: Arc<Store>) {
    let mut buffer: Vec<ApiMetric> = Vec::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(metric) => {
                        buffer.push(metric);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush(&store, std::mem::take(&mut buffer));
                        }
                    }
                    // All senders gone: final flush and exit.
                    None => {
                        flush(&store, std::mem::take(&mut buffer));
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&store, std::mem::take(&mut buffer));
                }
            }
        }
    }
}

fn flush(store: &Store, batch: Vec<ApiMetric>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    if let Err(e) = store.insert_api_metrics(&batch) {
        tracing::warn!("failed to flush {count} api metrics: {e}");
    } else {
        tracing::debug!("flushed {count} api metrics");
    }
}

/// Axum middleware capturing method, path, status, and latency.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    state.metrics.record(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_millis() as i64,
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_flush_reaches_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let recorder = spawn(store.clone());
        for i in 0..3 {
            recorder.record("GET", "/api/logs", 200, i);
        }
        drop(recorder);
        // Writer drains and flushes once the sender side is gone.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = store
            .api_metrics_snapshot(&(Utc::now() - chrono::Duration::minutes(1)))
            .unwrap();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.server_errors, 0);
    }
}
