use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::convert::Infallible;

use crate::AppState;
use crate::error::{Error, Result};
use crate::ingest;
use crate::models::log::{IngestRequest, Level, LogEntry};
use crate::query;
use crate::store::{EntryQuery, Order};

fn default_limit() -> u32 {
    100
}

/// Query parameters shared by the list and export endpoints.
#[derive(Debug, Deserialize)]
pub struct LogQueryParams {
    pub service: Option<String>,
    pub level: Option<String>,
    pub search: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    pub sort: Option<String>,
}

impl LogQueryParams {
    fn into_entry_query(self) -> Result<EntryQuery> {
        let mut q = EntryQuery::new();
        if let Some(level) = self.level {
            q.level = Some(
                Level::parse(&level)
                    .ok_or_else(|| Error::validation(format!("invalid level: {level}")))?,
            );
        }
        q.service = self.service;
        q.from = self.from.as_deref().map(parse_rfc3339).transpose()?;
        q.to = self.to.as_deref().map(parse_rfc3339).transpose()?;
        q.order = match self.sort.as_deref() {
            None | Some("desc") => Order::Desc,
            Some("asc") => Order::Asc,
            Some(other) => {
                return Err(Error::validation(format!("invalid sort: {other}")));
            }
        };
        if let Some(search) = self.search.as_deref().filter(|s| !s.trim().is_empty()) {
            q.predicate = Some(query::compile(search)?);
        }
        q.limit = self.limit.min(1000);
        q.offset = self.offset;
        Ok(q)
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::validation(format!("invalid timestamp {s:?}: {e}")))
}

/// POST /api/logs
pub async fn ingest_log(
    State(state): State<AppState>,
    Json(raw): Json<IngestRequest>,
) -> Result<impl IntoResponse> {
    let id = ingest::ingest(&state.store, &state.hub, raw).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "status": "created" })),
    ))
}

/// GET /api/logs
pub async fn query_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LogQueryParams>,
) -> Result<impl IntoResponse> {
    let search = params.search.clone();
    let limit = params.limit.min(1000);
    let offset = params.offset;
    let q = params.into_entry_query()?;
    let (entries, count) = state.store.query_entries(&q)?;

    // An authenticated caller's searches land in their history.
    if let Some(search) = search {
        if let Some(token) = super::bearer_token(&headers) {
            if let Ok(session) = state.sessions.validate(&token).await {
                if let Err(e) = state.store.append_search_history(&session.user_id, &search) {
                    tracing::debug!("search history append failed: {e}");
                }
            }
        }
    }

    Ok(Json(serde_json::json!({
        "entries": entries,
        "count": count,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /api/logs/{id}
pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<LogEntry>> {
    Ok(Json(state.store.get_entry(id)?))
}

/// GET /api/logs/stats
pub async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.store.stats()?))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub before: DateTime<Utc>,
}

/// DELETE /api/logs
pub async fn delete_logs(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Result<impl IntoResponse> {
    let deleted = state.store.delete_before(&req.before)?;
    ingest::emit_self(
        &state.store,
        &state.hub,
        "warn",
        format!("bulk delete removed {deleted} entries before {}", req.before),
        Some(serde_json::json!({ "deleted": deleted })),
    )
    .await;
    Ok(Json(serde_json::json!({
        "deleted": deleted,
        "timestamp": req.before,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

/// GET /api/logs/correlation/{cid}
pub async fn get_correlated(
    State(state): State<AppState>,
    Path(cid): Path<String>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse> {
    let entries = state.store.correlated(&cid, page.limit, page.offset)?;
    Ok(Json(serde_json::json!({
        "correlation_id": cid,
        "entries": entries,
        "limit": page.limit,
        "offset": page.offset,
    })))
}

/// GET /api/logs/correlation/{cid}/metadata
pub async fn get_correlation_metadata(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.store.correlation_metadata(&cid)?))
}

/// GET /api/logs/correlation/{cid}/timeline
pub async fn get_correlation_timeline(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<impl IntoResponse> {
    let entries = state.store.correlation_timeline(&cid)?;
    Ok(Json(serde_json::json!({
        "correlation_id": cid,
        "entries": entries,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AnalysisRequest {
    pub issue_category: String,
    pub severity_score: i64,
}

/// PUT /api/logs/{id}/analysis — enrichment write-back from the analysis
/// pipeline; the derived fields are write-once.
pub async fn set_analysis(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AnalysisRequest>,
) -> Result<impl IntoResponse> {
    state
        .store
        .set_analysis(id, &req.issue_category, req.severity_score)?;
    Ok(Json(serde_json::json!({ "id": id, "status": "enriched" })))
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    #[serde(default)]
    pub format: Option<String>,
    pub service: Option<String>,
    pub level: Option<String>,
    pub search: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Export batch cap: one request streams at most this many entries.
const EXPORT_LIMIT: u32 = 10_000;

/// GET /api/logs/export?format=json|csv
pub async fn export_logs(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response> {
    let format = params.format.as_deref().unwrap_or("json");
    if format != "json" && format != "csv" {
        return Err(Error::validation(format!("invalid format: {format}")));
    }

    let list_params = LogQueryParams {
        service: params.service,
        level: params.level,
        search: params.search,
        from: params.from,
        to: params.to,
        limit: EXPORT_LIMIT,
        offset: 0,
        sort: Some("asc".into()),
    };
    let q = list_params.into_entry_query()?;
    let (entries, _) = state.store.query_entries(&q)?;

    let (content_type, filename, chunks) = match format {
        "csv" => (
            "text/csv",
            "logs-export.csv",
            csv_chunks(&entries),
        ),
        _ => ("application/json", "logs-export.json", json_chunks(&entries)),
    };

    let stream = tokio_stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(e.into()))?;
    Ok(response)
}

fn json_chunks(entries: &[LogEntry]) -> Vec<String> {
    let mut chunks = Vec::with_capacity(entries.len() + 2);
    chunks.push("[".to_string());
    for (i, entry) in entries.iter().enumerate() {
        let mut chunk = serde_json::to_string(entry).unwrap_or_else(|_| "null".to_string());
        if i + 1 < entries.len() {
            chunk.push(',');
        }
        chunks.push(chunk);
    }
    chunks.push("]".to_string());
    chunks
}

fn csv_chunks(entries: &[LogEntry]) -> Vec<String> {
    let mut chunks = Vec::with_capacity(entries.len() + 1);
    chunks.push("id,timestamp,level,service,message,correlation_id,trace_id,span_id\n".to_string());
    for entry in entries {
        chunks.push(format!(
            "{},{},{},{},{},{},{},{}\n",
            entry.id,
            entry.timestamp.to_rfc3339(),
            entry.level,
            csv_escape(&entry.service),
            csv_escape(&entry.message),
            csv_escape(entry.correlation_id.as_deref().unwrap_or("")),
            csv_escape(entry.trace_id.as_deref().unwrap_or("")),
            csv_escape(entry.span_id.as_deref().unwrap_or("")),
        ));
    }
    chunks
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            id: 1,
            timestamp: Utc::now(),
            level: Level::Info,
            service: "portal".into(),
            message: message.into(),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            context: None,
            issue_category: None,
            severity_score: None,
        }
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_csv_chunks_have_header_and_rows() {
        let chunks = csv_chunks(&[entry("hello, world")]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("id,timestamp"));
        assert!(chunks[1].contains("\"hello, world\""));
    }

    #[test]
    fn test_json_chunks_concatenate_to_valid_json() {
        let chunks = json_chunks(&[entry("a"), entry("b")]);
        let combined: String = chunks.concat();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&combined).unwrap();
        assert_eq!(parsed.len(), 2);

        let empty: Vec<serde_json::Value> =
            serde_json::from_str(&json_chunks(&[]).concat()).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_params_validation() {
        let params = LogQueryParams {
            service: None,
            level: Some("loud".into()),
            search: None,
            from: None,
            to: None,
            limit: 100,
            offset: 0,
            sort: None,
        };
        assert!(params.into_entry_query().is_err());

        let params = LogQueryParams {
            service: None,
            level: None,
            search: None,
            from: None,
            to: None,
            limit: 100,
            offset: 0,
            sort: Some("sideways".into()),
        };
        assert!(params.into_entry_query().is_err());

        let params = LogQueryParams {
            service: Some("portal".into()),
            level: Some("error".into()),
            search: Some("level:warn OR level:error".into()),
            from: Some("2026-01-01T00:00:00Z".into()),
            to: None,
            limit: 5000,
            offset: 0,
            sort: Some("asc".into()),
        };
        let q = params.into_entry_query().unwrap();
        assert_eq!(q.limit, 1000);
        assert_eq!(q.order, Order::Asc);
        assert!(q.predicate.is_some());
    }
}
