use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::checkers::{CheckContext, Checker, build_checkers};
use super::repair;
use crate::config::AppConfig;
use crate::error::Result;
use crate::hub::Hub;
use crate::ingest;
use crate::models::health::{CheckStatus, HealthReport};
use crate::store::Store;

/// Scheduler cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Minimum spacing between automatic repairs of the same service.
pub const REPAIR_RATE_LIMIT: Duration = Duration::from_secs(10 * 60);

/// Run every checker concurrently and aggregate the report.
pub async fn run_health_checks(cx: &CheckContext, checkers: &[Checker]) -> HealthReport {
    let start = Instant::now();
    let results = join_all(checkers.iter().map(|c| c.run(cx))).await;
    HealthReport::from_results(results, start.elapsed().as_millis() as i64)
}

/// Spawn the 5-minute scheduler loop. Honors the service-wide shutdown
/// signal and finishes the in-flight tick before exiting.
pub fn spawn_health_scheduler(
    store: Arc<Store>,
    hub: Arc<Hub>,
    config: Arc<AppConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let checkers = build_checkers(&config.health);
        if checkers.len() <= 1 && config.health.services.is_empty() {
            tracing::info!("health scheduler: no inventory configured, database checks only");
        }
        tracing::info!("health scheduler: started ({} checkers)", checkers.len());

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("health scheduler: shutting down");
                    return;
                }
            }
            if let Err(e) = run_tick(&store, &hub, &config, &checkers).await {
                tracing::error!("health scheduler tick failed: {e}");
            }
        }
    });
}

/// One tick: probe, persist, consult policies, enact bounded repairs.
pub async fn run_tick(
    store: &Arc<Store>,
    hub: &Arc<Hub>,
    config: &AppConfig,
    checkers: &[Checker],
) -> Result<()> {
    let policies = store
        .list_policies()?
        .into_iter()
        .map(|p| (p.service.clone(), p))
        .collect();
    let cx = CheckContext::new(
        store.clone(),
        config.orchestrator_url.clone(),
        policies,
    );

    let report = run_health_checks(&cx, checkers).await;
    let check_id = store.insert_health_check(&report, "scheduled", &Utc::now())?;
    tracing::debug!(
        "health check {check_id}: {} ({}/{} passed)",
        report.status.as_str(),
        report.passed,
        report.total
    );

    for detail in &report.details {
        let Ok(policy) = store.get_policy(&detail.name) else {
            // Checkers like "docker" or "gateway" have no per-service
            // policy; nothing to consult.
            continue;
        };

        match detail.status {
            CheckStatus::Fail if policy.alert_on_fail => {
                ingest::emit_self(
                    store,
                    hub,
                    "error",
                    format!("health check failed for {}: {}", detail.name, detail.message),
                    Some(serde_json::json!({ "check_id": check_id, "service": detail.name })),
                )
                .await;
            }
            CheckStatus::Warn if policy.alert_on_warn => {
                ingest::emit_self(
                    store,
                    hub,
                    "warn",
                    format!("health check warned for {}: {}", detail.name, detail.message),
                    Some(serde_json::json!({ "check_id": check_id, "service": detail.name })),
                )
                .await;
            }
            _ => {}
        }

        if detail.status != CheckStatus::Fail || !policy.auto_repair_enabled {
            continue;
        }

        // Bounded repair: at most one automatic attempt per service per
        // rate-limit window.
        if let Some(last) = store.last_auto_repair_at(&detail.name)? {
            let elapsed = Utc::now().signed_duration_since(last);
            if elapsed.num_seconds() < REPAIR_RATE_LIMIT.as_secs() as i64 {
                tracing::debug!(
                    "repair for {} skipped: last attempt {}s ago",
                    detail.name,
                    elapsed.num_seconds()
                );
                continue;
            }
        }

        if let Err(e) = repair::execute_repair(
            store,
            &cx.client,
            config.orchestrator_url.as_deref(),
            Some(&check_id),
            &detail.name,
            "health_check_failed",
            policy.repair_strategy,
            "auto",
        )
        .await
        {
            tracing::error!("repair for {} could not be recorded: {e}", detail.name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AppConfig, HealthInventory, RetentionSettings, ServiceTarget, SmtpSettings, StorageKind,
    };
    use crate::models::health::RepairStrategy;

    fn test_config(inventory: HealthInventory) -> AppConfig {
        AppConfig {
            port: 0,
            database_path: ":memory:".into(),
            redis_url: None,
            logs_service_url: None,
            session_service_url: None,
            orchestrator_url: None,
            retention: RetentionSettings {
                days: 30,
                archive: crate::config::ArchiveSettings {
                    enabled: false,
                    compression: false,
                    storage: StorageKind::Local,
                    local_path: "./archives".into(),
                    s3_bucket: None,
                    s3_region: None,
                },
            },
            smtp: SmtpSettings {
                host: None,
                port: 587,
                user: None,
                pass: None,
                from: "foghorn@localhost".into(),
            },
            health: inventory,
        }
    }

    /// S8 shape: a failing HTTP checker with auto-repair enabled produces a
    /// failed check row, a detail naming the service, and one repair row
    /// that progressed out of pending.
    #[tokio::test]
    async fn test_failing_checker_drives_repair() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());

        let mut inventory = HealthInventory::default();
        inventory.services.push(ServiceTarget {
            name: "review".into(),
            // Nothing listens here: the probe fails fast.
            url: "http://127.0.0.1:1/health".into(),
        });
        let config = test_config(inventory);

        store
            .seed_default_policies(&["review".to_string()])
            .unwrap();
        let mut policy = store.get_policy("review").unwrap();
        policy.auto_repair_enabled = true;
        policy.repair_strategy = RepairStrategy::Restart;
        store.upsert_policy(&policy).unwrap();

        // Drop the database checker to keep the probe surface minimal.
        let checkers: Vec<Checker> = build_checkers(&config.health)
            .into_iter()
            .filter(|c| c.name() == "review")
            .collect();
        run_tick(&store, &hub, &config, &checkers).await.unwrap();

        let checks = store.list_health_checks(1).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, CheckStatus::Fail);

        let details = store.health_check_details(&checks[0].id).unwrap();
        assert!(details.iter().any(|d| d.name == "review"));

        let repairs = store.list_repairs(Some("review"), 10).unwrap();
        assert_eq!(repairs.len(), 1);
        assert!(matches!(repairs[0].status.as_str(), "succeeded" | "failed"));
        assert_eq!(repairs[0].trigger, "auto");
    }

    #[tokio::test]
    async fn test_repair_rate_limited_within_window() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());

        let mut inventory = HealthInventory::default();
        inventory.services.push(ServiceTarget {
            name: "review".into(),
            url: "http://127.0.0.1:1/health".into(),
        });
        let config = test_config(inventory);

        store
            .seed_default_policies(&["review".to_string()])
            .unwrap();
        let mut policy = store.get_policy("review").unwrap();
        policy.auto_repair_enabled = true;
        store.upsert_policy(&policy).unwrap();

        let checkers: Vec<Checker> = build_checkers(&config.health)
            .into_iter()
            .filter(|c| c.name() == "review")
            .collect();

        run_tick(&store, &hub, &config, &checkers).await.unwrap();
        run_tick(&store, &hub, &config, &checkers).await.unwrap();

        // Two failing ticks, one repair: the second fell in the window.
        assert_eq!(store.list_repairs(Some("review"), 10).unwrap().len(), 1);
        assert_eq!(store.list_health_checks(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_database_checker_passes_against_live_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hub = Arc::new(Hub::new());
        let config = test_config(HealthInventory::default());

        let checkers = vec![Checker::Database];
        run_tick(&store, &hub, &config, &checkers).await.unwrap();

        let checks = store.list_health_checks(1).unwrap();
        assert_eq!(checks[0].status, CheckStatus::Pass);
        assert_eq!(checks[0].passed, 1);
    }
}
