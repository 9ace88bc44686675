use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single probe or an aggregated report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<CheckStatus> {
        match s {
            "pass" => Some(CheckStatus::Pass),
            "warn" => Some(CheckStatus::Warn),
            "fail" => Some(CheckStatus::Fail),
            _ => None,
        }
    }

    /// fail > warn > pass when folding sub-check results into an overall
    /// status.
    pub fn worst(self, other: CheckStatus) -> CheckStatus {
        use CheckStatus::*;
        match (self, other) {
            (Fail, _) | (_, Fail) => Fail,
            (Warn, _) | (_, Warn) => Warn,
            _ => Pass,
        }
    }
}

/// Result of one sub-probe inside a scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// Aggregate of all checker results from a single run.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: CheckStatus,
    pub duration_ms: i64,
    pub total: u32,
    pub passed: u32,
    pub warned: u32,
    pub failed: u32,
    pub details: Vec<CheckResult>,
}

impl HealthReport {
    pub fn from_results(details: Vec<CheckResult>, duration_ms: i64) -> Self {
        let mut status = CheckStatus::Pass;
        let (mut passed, mut warned, mut failed) = (0u32, 0u32, 0u32);
        for r in &details {
            status = status.worst(r.status);
            match r.status {
                CheckStatus::Pass => passed += 1,
                CheckStatus::Warn => warned += 1,
                CheckStatus::Fail => failed += 1,
            }
        }
        HealthReport {
            status,
            duration_ms,
            total: details.len() as u32,
            passed,
            warned,
            failed,
            details,
        }
    }
}

/// Persisted snapshot of one health run.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: CheckStatus,
    pub duration_ms: i64,
    pub total: u32,
    pub passed: u32,
    pub warned: u32,
    pub failed: u32,
    pub trigger: String,
}

/// Repair strategy enacted against the platform orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStrategy {
    Restart,
    Rebuild,
    Rollback,
}

impl RepairStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStrategy::Restart => "restart",
            RepairStrategy::Rebuild => "rebuild",
            RepairStrategy::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Option<RepairStrategy> {
        match s {
            "restart" => Some(RepairStrategy::Restart),
            "rebuild" => Some(RepairStrategy::Rebuild),
            "rollback" => Some(RepairStrategy::Rollback),
            _ => None,
        }
    }
}

/// Per-service health policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub service: String,
    pub max_response_time_ms: i64,
    pub auto_repair_enabled: bool,
    pub repair_strategy: RepairStrategy,
    pub alert_on_warn: bool,
    pub alert_on_fail: bool,
}

impl HealthPolicy {
    pub fn default_for(service: &str) -> Self {
        HealthPolicy {
            service: service.to_string(),
            max_response_time_ms: 2000,
            auto_repair_enabled: false,
            repair_strategy: RepairStrategy::Restart,
            alert_on_warn: false,
            alert_on_fail: true,
        }
    }
}

/// Record of one repair attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AutoRepairRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub check_id: Option<String>,
    pub service: String,
    pub issue_type: String,
    pub action: RepairStrategy,
    pub status: String,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub trigger: String,
}

/// One bucket of the windowed trend aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct TrendBucket {
    pub hour: String,
    pub passed: u64,
    pub warned: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
}
