use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::AppState;
use crate::error::{Error, Result};
use crate::models::alert::AlertConfig;
use crate::models::search::{SavedSearchRequest, ShareRequest};
use crate::query;

use super::require_session;

/// GET /api/searches
pub async fn list_searches(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(state.store.list_saved_searches(&session.user_id)?))
}

/// POST /api/searches
pub async fn create_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SavedSearchRequest>,
) -> Result<impl IntoResponse> {
    let session = require_session(&state, &headers).await?;
    if req.name.trim().is_empty() {
        return Err(Error::validation("name is required"));
    }
    // The stored query must itself parse.
    query::parse(&req.query)?;
    let search = state
        .store
        .create_saved_search(&session.user_id, &req.name, &req.query)?;
    Ok((StatusCode::CREATED, Json(search)))
}

/// GET /api/searches/{id}
pub async fn get_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = require_session(&state, &headers).await?;
    let search = state.store.get_saved_search(&id)?;
    if search.user_id != session.user_id && !search.shared_with.contains(&session.user_id) {
        return Err(Error::Forbidden);
    }
    Ok(Json(search))
}

/// PUT /api/searches/{id}
pub async fn update_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SavedSearchRequest>,
) -> Result<impl IntoResponse> {
    let session = require_session(&state, &headers).await?;
    query::parse(&req.query)?;
    if !state
        .store
        .update_saved_search(&id, &session.user_id, &req.name, &req.query)?
    {
        return Err(Error::NotFound("search"));
    }
    Ok(Json(state.store.get_saved_search(&id)?))
}

/// DELETE /api/searches/{id}
pub async fn delete_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = require_session(&state, &headers).await?;
    if !state.store.delete_saved_search(&id, &session.user_id)? {
        return Err(Error::NotFound("search"));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// POST /api/searches/{id}/share
pub async fn share_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ShareRequest>,
) -> Result<impl IntoResponse> {
    let session = require_session(&state, &headers).await?;
    let search = state.store.get_saved_search(&id)?;
    if search.user_id != session.user_id {
        return Err(Error::Forbidden);
    }
    state.store.share_saved_search(&id, &req.principals)?;
    Ok(Json(state.store.get_saved_search(&id)?))
}

/// GET /api/searches/history
pub async fn search_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(state.store.search_history(&session.user_id)?))
}

// ── Alert configuration ──

/// GET /api/alerts/config
pub async fn list_alert_configs(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.store.list_alert_configs(false)?))
}

/// GET /api/alerts/config/{service}
pub async fn get_alert_config(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.store.get_alert_config(&service)?))
}

#[derive(Debug, Deserialize)]
pub struct AlertConfigRequest {
    pub error_rate_per_minute: u32,
    pub warn_rate_per_minute: u32,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// PUT /api/alerts/config/{service}
pub async fn put_alert_config(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(req): Json<AlertConfigRequest>,
) -> Result<impl IntoResponse> {
    let config = AlertConfig {
        service,
        error_rate_per_minute: req.error_rate_per_minute,
        warn_rate_per_minute: req.warn_rate_per_minute,
        email: req.email,
        webhook_url: req.webhook_url,
        enabled: req.enabled,
    };
    state.store.upsert_alert_config(&config)?;
    Ok(Json(config))
}

#[derive(Debug, Deserialize)]
pub struct AlertListParams {
    #[serde(default = "default_alert_limit")]
    pub limit: u32,
}

fn default_alert_limit() -> u32 {
    50
}

/// GET /api/alerts
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertListParams>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.store.list_alerts(params.limit.min(200))?))
}
