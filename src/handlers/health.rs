use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;

use crate::AppState;
use crate::error::{Error, Result};
use crate::health::checkers::{CheckContext, build_checkers};
use crate::health::repair;
use crate::health::scheduler::run_health_checks;
use crate::models::health::{CheckStatus, HealthPolicy, HealthReport};

async fn run_report(state: &AppState, trigger: &str) -> Result<HealthReport> {
    let policies = state
        .store
        .list_policies()?
        .into_iter()
        .map(|p| (p.service.clone(), p))
        .collect();
    let cx = CheckContext::new(
        state.store.clone(),
        state.config.orchestrator_url.clone(),
        policies,
    );
    let checkers = build_checkers(&state.config.health);
    let report = run_health_checks(&cx, &checkers).await;
    state.store.insert_health_check(&report, trigger, &Utc::now())?;
    Ok(report)
}

#[derive(Debug, Deserialize)]
pub struct FormatParams {
    pub format: Option<String>,
}

/// GET /api/logs/healthcheck — aggregated on-demand report. 503 when the
/// overall status is fail.
pub async fn healthcheck(
    State(state): State<AppState>,
    Query(params): Query<FormatParams>,
) -> Result<Response> {
    let format = params.format.as_deref().unwrap_or("json");
    if format != "json" && format != "human" {
        return Err(Error::validation(format!("invalid format: {format}")));
    }

    let report = run_report(&state, "api").await?;
    let status = if report.status == CheckStatus::Fail {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    if format == "human" {
        let mut lines = vec![format!(
            "overall: {} ({} checks, {} passed, {} warned, {} failed, {}ms)",
            report.status.as_str(),
            report.total,
            report.passed,
            report.warned,
            report.failed,
            report.duration_ms,
        )];
        for detail in &report.details {
            lines.push(format!(
                "  {}: {} {} ({}ms)",
                detail.name,
                detail.status.as_str(),
                detail.message,
                detail.duration_ms,
            ));
        }
        return Ok((status, lines.join("\n")).into_response());
    }
    Ok((status, Json(report)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

/// GET /api/health/history
pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse> {
    let checks = state.store.list_health_checks(params.limit.min(200))?;
    Ok(Json(serde_json::json!({ "checks": checks })))
}

#[derive(Debug, Deserialize)]
pub struct TrendParams {
    #[serde(default = "default_trend_hours")]
    pub hours: u32,
}

fn default_trend_hours() -> u32 {
    24
}

/// GET /api/health/trends/{service}?hours=1..720
pub async fn trends(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(params): Query<TrendParams>,
) -> Result<impl IntoResponse> {
    if !(1..=720).contains(&params.hours) {
        return Err(Error::validation("hours must be within 1..720"));
    }
    let buckets = state.store.health_trends(&service, params.hours)?;
    Ok(Json(serde_json::json!({
        "service": service,
        "hours": params.hours,
        "buckets": buckets,
    })))
}

/// GET /api/health/policies
pub async fn list_policies(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.store.list_policies()?))
}

/// GET /api/health/policies/{service}
pub async fn get_policy(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<HealthPolicy>> {
    Ok(Json(state.store.get_policy(&service)?))
}

#[derive(Debug, Deserialize)]
pub struct PolicyRequest {
    pub max_response_time_ms: i64,
    pub auto_repair_enabled: bool,
    pub repair_strategy: String,
    #[serde(default)]
    pub alert_on_warn: bool,
    #[serde(default = "default_true")]
    pub alert_on_fail: bool,
}

fn default_true() -> bool {
    true
}

/// PUT /api/health/policies/{service}
pub async fn put_policy(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(req): Json<PolicyRequest>,
) -> Result<Json<HealthPolicy>> {
    if req.max_response_time_ms <= 0 {
        return Err(Error::validation("max_response_time_ms must be positive"));
    }
    let policy = HealthPolicy {
        service: service.clone(),
        max_response_time_ms: req.max_response_time_ms,
        auto_repair_enabled: req.auto_repair_enabled,
        repair_strategy: repair::parse_strategy(&req.repair_strategy)?,
        alert_on_warn: req.alert_on_warn,
        alert_on_fail: req.alert_on_fail,
    };
    state.store.upsert_policy(&policy)?;
    Ok(Json(policy))
}

#[derive(Debug, Deserialize)]
pub struct RepairListParams {
    pub service: Option<String>,
    #[serde(default = "default_repair_limit")]
    pub limit: u32,
}

fn default_repair_limit() -> u32 {
    50
}

/// GET /api/health/repairs
pub async fn list_repairs(
    State(state): State<AppState>,
    Query(params): Query<RepairListParams>,
) -> Result<impl IntoResponse> {
    let repairs = state
        .store
        .list_repairs(params.service.as_deref(), params.limit.min(200))?;
    Ok(Json(serde_json::json!({ "repairs": repairs })))
}

#[derive(Debug, Deserialize, Default)]
pub struct ManualRepairRequest {
    pub strategy: Option<String>,
}

/// POST /api/health/repair/{service} — manual trigger. Synchronous, and
/// exempt from the automatic rate limit. The strategy defaults to the
/// service's policy.
pub async fn manual_repair(
    State(state): State<AppState>,
    Path(service): Path<String>,
    body: Option<Json<ManualRepairRequest>>,
) -> Result<impl IntoResponse> {
    let requested = body.and_then(|Json(b)| b.strategy);
    let strategy = match requested {
        Some(name) => repair::parse_strategy(&name)?,
        None => state.store.get_policy(&service)?.repair_strategy,
    };

    let row = repair::execute_repair(
        &state.store,
        &state.http,
        state.config.orchestrator_url.as_deref(),
        None,
        &service,
        "manual_trigger",
        strategy,
        "manual",
    )
    .await?;
    Ok(Json(row))
}
