use std::time::Instant;

use crate::error::{Error, Result};
use crate::models::health::{AutoRepairRow, RepairStrategy};
use crate::store::Store;

/// Execute one repair against the platform orchestrator, recording the
/// attempt as pending first and finishing it with the observed outcome.
/// Rate limiting is the caller's concern; manual triggers bypass it.
pub async fn execute_repair(
    store: &Store,
    client: &reqwest::Client,
    orchestrator_url: Option<&str>,
    check_id: Option<&str>,
    service: &str,
    issue_type: &str,
    strategy: RepairStrategy,
    trigger: &str,
) -> Result<AutoRepairRow> {
    let repair_id = store.insert_repair_pending(check_id, service, issue_type, strategy, trigger)?;
    tracing::info!(
        "repair {repair_id}: {} {service} ({trigger}, issue={issue_type})",
        strategy.as_str()
    );

    let start = Instant::now();
    let outcome = match orchestrator_url {
        Some(base) => dispatch(client, base, service, strategy).await,
        None => Err("orchestrator not configured".to_string()),
    };
    let duration_ms = start.elapsed().as_millis() as i64;

    match outcome {
        Ok(()) => {
            store.finish_repair(&repair_id, true, None, duration_ms)?;
            tracing::info!("repair {repair_id}: succeeded in {duration_ms}ms");
        }
        Err(ref reason) => {
            store.finish_repair(&repair_id, false, Some(reason), duration_ms)?;
            tracing::warn!("repair {repair_id}: failed after {duration_ms}ms: {reason}");
        }
    }
    store.get_repair(&repair_id)
}

async fn dispatch(
    client: &reqwest::Client,
    base: &str,
    service: &str,
    strategy: RepairStrategy,
) -> std::result::Result<(), String> {
    let url = format!(
        "{}/api/services/{service}/{}",
        base.trim_end_matches('/'),
        strategy.as_str()
    );
    match client.post(&url).send().await {
        Ok(response) if response.status().is_success() => Ok(()),
        Ok(response) => Err(format!("orchestrator returned {}", response.status())),
        Err(e) => Err(format!("orchestrator unreachable: {e}")),
    }
}

/// Parse a strategy name from an operator request.
pub fn parse_strategy(s: &str) -> Result<RepairStrategy> {
    RepairStrategy::parse(s)
        .ok_or_else(|| Error::validation(format!("unknown repair strategy {s:?}")))
}
