use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-service alerting thresholds, maintained by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub service: String,
    pub error_rate_per_minute: u32,
    pub warn_rate_per_minute: u32,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub enabled: bool,
}

/// A fired alert. The alert engine is the sole writer of these rows.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub service: String,
    pub kind: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

/// Request-level counters snapshot the alert engine reads alongside log
/// rates.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ApiMetricsSnapshot {
    pub requests: u64,
    pub server_errors: u64,
}

/// One recorded API request, written by the metrics recorder.
#[derive(Debug, Clone)]
pub struct ApiMetric {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: i64,
    pub recorded_at: DateTime<Utc>,
}
