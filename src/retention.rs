//! Age-based retention: a daily sweep deletes entries older than the
//! configured window, optionally archiving them first.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::archive::{self, ArchiveStore};
use crate::config::RetentionSettings;
use crate::error::Result;
use crate::hub::Hub;
use crate::ingest;
use crate::store::Store;

/// Cap on how many entries one sweep will archive.
pub const ARCHIVE_BATCH_LIMIT: u32 = 10_000;

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the retention task (fire-and-forget). Honors the service-wide
/// shutdown signal and finishes the current sweep before exiting.
pub fn spawn_retention_task(
    store: Arc<Store>,
    hub: Arc<Hub>,
    archive_store: Option<Arc<ArchiveStore>>,
    settings: RetentionSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        // Let startup settle before the first sweep.
        tokio::time::sleep(Duration::from_secs(60)).await;
        tracing::info!(
            "retention: started (days={}, archive={})",
            settings.days,
            settings.archive.enabled
        );

        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("retention: shutting down");
                    return;
                }
            }
            match run_retention(&store, archive_store.as_deref(), &settings) {
                Ok(deleted) => {
                    ingest::emit_self(
                        &store,
                        &hub,
                        "info",
                        format!("retention sweep deleted {deleted} entries"),
                        Some(serde_json::json!({ "deleted": deleted })),
                    )
                    .await;
                }
                Err(e) => tracing::error!("retention sweep failed: {e}"),
            }
        }
    });
}

/// One sweep: archive the oldest batch if configured, then delete
/// everything older than the cutoff. Returns the deleted count.
pub fn run_retention(
    store: &Store,
    archive_store: Option<&ArchiveStore>,
    settings: &RetentionSettings,
) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(settings.days as i64);

    if settings.archive.enabled {
        if let Some(backend) = archive_store {
            let batch = store.entries_older_than(&cutoff, ARCHIVE_BATCH_LIMIT)?;
            if !batch.is_empty() {
                let compress = settings.archive.compression;
                let bytes = archive::encode_batch(&batch, compress)?;
                let name = archive::archive_filename(&Utc::now(), compress);
                backend.save_archive(&name, &bytes)?;
                tracing::info!(
                    "retention: archived {} entries to {name} ({} bytes)",
                    batch.len(),
                    bytes.len()
                );
            }
        }
    }

    let deleted = store.delete_before(&cutoff)?;
    tracing::info!("retention: deleted {deleted} entries older than {cutoff}");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveSettings, StorageKind};
    use crate::models::log::IngestRequest;
    use crate::store::EntryQuery;

    fn seed_aged(store: &Store, days_old: i64, message: &str) {
        let now = Utc::now();
        let req = IngestRequest {
            service: "portal".into(),
            level: "info".into(),
            message: message.into(),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            context: None,
            timestamp: Some(now - chrono::Duration::days(days_old)),
        };
        store.insert_entry(&req.into_entry(now).unwrap()).unwrap();
    }

    fn settings(days: u32, archive_enabled: bool, compression: bool, dir: &str) -> RetentionSettings {
        RetentionSettings {
            days,
            archive: ArchiveSettings {
                enabled: archive_enabled,
                compression,
                storage: StorageKind::Local,
                local_path: dir.to_string(),
                s3_bucket: None,
                s3_region: None,
            },
        }
    }

    #[test]
    fn test_sweep_without_archive() {
        let store = Store::open_in_memory().unwrap();
        seed_aged(&store, 2, "fresh");
        seed_aged(&store, 60, "stale");

        let deleted = run_retention(&store, None, &settings(30, false, false, "")).unwrap();
        assert_eq!(deleted, 1);
        let (entries, total) = store.query_entries(&EntryQuery::new()).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].message, "fresh");
    }

    #[test]
    fn test_sweep_archives_compressed_before_delete() {
        let store = Store::open_in_memory().unwrap();
        seed_aged(&store, 2, "fresh");
        seed_aged(&store, 60, "stale");

        let dir = std::env::temp_dir().join(format!("foghorn-retention-{}", uuid::Uuid::new_v4()));
        let dir_s = dir.to_str().unwrap().to_string();
        let backend = ArchiveStore::Local(crate::archive::LocalArchive::new(dir.clone()));

        let deleted =
            run_retention(&store, Some(&backend), &settings(30, true, true, &dir_s)).unwrap();
        assert_eq!(deleted, 1);

        // Exactly one gzipped archive whose restored content is the stale
        // entry.
        let names = backend.list_archives().unwrap();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json.gz"));

        let restored = archive::decode_batch(&backend.get_archive(&names[0]).unwrap()).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].message, "stale");

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_empty_batch_writes_no_archive() {
        let store = Store::open_in_memory().unwrap();
        seed_aged(&store, 1, "fresh");

        let dir = std::env::temp_dir().join(format!("foghorn-retention-{}", uuid::Uuid::new_v4()));
        let dir_s = dir.to_str().unwrap().to_string();
        let backend = ArchiveStore::Local(crate::archive::LocalArchive::new(dir.clone()));

        let deleted =
            run_retention(&store, Some(&backend), &settings(30, true, false, &dir_s)).unwrap();
        assert_eq!(deleted, 0);
        assert!(backend.list_archives().unwrap().is_empty());

        std::fs::remove_dir_all(dir).ok();
    }
}
