//! The ingest path: validate, enrich, persist, then publish to the hub.
//!
//! The service also ingests its own observability events, tagged
//! `service="logs"`. A task-local re-entry counter bounded at 1 keeps that
//! loop from amplifying: a self-tagged entry arriving from the
//! instrumentation flow is persisted but never re-published, and
//! instrumentation emitted while the same flow's instrumentation is
//! already in flight is dropped outright. The counter is scoped to one
//! ingestion flow, so unrelated tasks emitting concurrently never suppress
//! each other.

use chrono::Utc;
use std::sync::Arc;

use crate::error::Result;
use crate::hub::Hub;
use crate::models::log::IngestRequest;
use crate::models::stream::LogEvent;
use crate::store::Store;

/// Fixed service tag on the service's own observability events.
pub const SELF_SERVICE: &str = "logs";

tokio::task_local! {
    /// Depth of self-instrumentation within the current ingestion flow.
    static REENTRY: u32;
}

/// Ingest one producer-submitted entry. Returns the assigned id.
///
/// Publication failures never fail ingest: the hub accounts per-subscriber
/// drops and the producer sees success as soon as the entry is durable.
pub async fn ingest(store: &Store, hub: &Hub, raw: IngestRequest) -> Result<i64> {
    ingest_inner(store, hub, raw, false).await
}

async fn ingest_inner(
    store: &Store,
    hub: &Hub,
    raw: IngestRequest,
    from_instrumentation: bool,
) -> Result<i64> {
    let entry = raw.into_entry(Utc::now())?;
    let id = store.insert_entry(&entry)?;

    // Insert completes before publish begins, so a subscriber only ever
    // sees durably stored events.
    if from_instrumentation && entry.service == SELF_SERVICE {
        return Ok(id);
    }

    let event = LogEvent {
        id,
        timestamp: entry.timestamp,
        service: entry.service,
        level: entry.level.as_str().to_string(),
        message: entry.message,
        correlation_id: entry.correlation_id,
        context: entry.context,
    };
    hub.publish(&event).await;
    Ok(id)
}

/// Self-instrumentation: record one of the service's own events through the
/// normal ingest path, guarded against recursion.
pub async fn emit_self(
    store: &Arc<Store>,
    hub: &Arc<Hub>,
    level: &str,
    message: String,
    context: Option<serde_json::Value>,
) {
    // Bounded at 1: a second level of re-entry within the same ingestion
    // flow is dropped. A task with no counter set is depth 0.
    let depth = REENTRY.try_with(|depth| *depth).unwrap_or(0);
    if depth >= 1 {
        return;
    }

    let raw = IngestRequest {
        service: SELF_SERVICE.to_string(),
        level: level.to_string(),
        message,
        correlation_id: None,
        trace_id: None,
        span_id: None,
        context,
        timestamp: None,
    };
    let result = REENTRY
        .scope(depth + 1, ingest_inner(store, hub, raw, true))
        .await;
    if let Err(e) = result {
        // Failing to record our own event must never matter.
        tracing::debug!("self-instrumentation entry dropped: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::Level;
    use crate::store::EntryQuery;
    use std::collections::HashMap;

    fn request(service: &str, level: &str, message: &str) -> IngestRequest {
        IngestRequest {
            service: service.into(),
            level: level.into(),
            message: message.into(),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            context: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_persists_then_publishes() {
        let store = Store::open_in_memory().unwrap();
        let hub = Hub::new();
        let (sub, mut rx, _c) = crate::hub::Subscriber::new(1, HashMap::new());
        hub.register(sub);

        let before = Utc::now();
        let id = ingest(&store, &hub, request("portal", "info", "User logged in"))
            .await
            .unwrap();

        let entry = store.get_entry(id).unwrap();
        assert_eq!(entry.service, "portal");
        assert_eq!(entry.level, Level::Info);
        // Property 1: the stored timestamp is within skew of ingest time.
        let skew = (entry.timestamp - before).num_seconds().abs();
        assert!(skew <= 5);

        match rx.try_recv().unwrap() {
            crate::models::stream::ServerMessage::Log { event } => {
                assert_eq!(event.id, id);
                assert_eq!(event.service, "portal");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_entry_rejected_before_side_effects() {
        let store = Store::open_in_memory().unwrap();
        let hub = Hub::new();
        assert!(ingest(&store, &hub, request("", "info", "m")).await.is_err());
        assert!(
            ingest(&store, &hub, request("portal", "loud", "m"))
                .await
                .is_err()
        );
        let (_, total) = store.query_entries(&EntryQuery::new()).unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_backpressure_never_fails_ingest() {
        let store = Store::open_in_memory().unwrap();
        let hub = Hub::new();
        let (sub, _rx, _c) = crate::hub::Subscriber::new(1, HashMap::new());
        hub.register(sub.clone());

        // Saturate the queue, then keep ingesting.
        for i in 0..crate::hub::QUEUE_CAPACITY + 5 {
            ingest(&store, &hub, request("portal", "info", &format!("e{i}")))
                .await
                .unwrap();
        }
        assert_eq!(sub.drops(), 5);
    }

    #[tokio::test]
    async fn test_self_emitted_entries_are_stored_not_published() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());
        let (sub, mut rx, _c) = crate::hub::Subscriber::new(1, HashMap::new());
        hub.register(sub);

        emit_self(&store, &hub, "info", "retention pass done".into(), None).await;

        let mut q = EntryQuery::new();
        q.service = Some(SELF_SERVICE.into());
        let (entries, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].service, SELF_SERVICE);
        // Nothing fanned out for the self-tagged entry.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reentrant_emission_within_flow_dropped() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());

        // Simulate an emit arriving from inside an instrumentation flow.
        REENTRY
            .scope(1, emit_self(&store, &hub, "info", "nested".into(), None))
            .await;

        let mut q = EntryQuery::new();
        q.service = Some(SELF_SERVICE.into());
        let (_, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_unrelated_emissions_all_recorded() {
        // Emissions from independent tasks carry independent counters and
        // never suppress each other.
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                emit_self(&store, &hub, "info", format!("tick {i}"), None).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut q = EntryQuery::new();
        q.service = Some(SELF_SERVICE.into());
        let (_, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn test_external_logs_service_entries_still_publish() {
        // A producer legitimately named "logs" posting through the public
        // path is not the instrumentation flow and fans out normally.
        let store = Store::open_in_memory().unwrap();
        let hub = Hub::new();
        let (sub, mut rx, _c) = crate::hub::Subscriber::new(1, HashMap::new());
        hub.register(sub);

        ingest(&store, &hub, request(SELF_SERVICE, "info", "external"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
