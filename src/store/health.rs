use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{Store, format_timestamp, parse_timestamp};
use crate::error::{Error, Result};
use crate::models::health::{
    AutoRepairRow, CheckResult, CheckStatus, HealthCheckRow, HealthPolicy, HealthReport,
    RepairStrategy, TrendBucket,
};

fn row_to_policy(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealthPolicy> {
    let strategy: String = row.get(3)?;
    Ok(HealthPolicy {
        service: row.get(0)?,
        max_response_time_ms: row.get(1)?,
        auto_repair_enabled: row.get(2)?,
        repair_strategy: RepairStrategy::parse(&strategy).unwrap_or(RepairStrategy::Restart),
        alert_on_warn: row.get(4)?,
        alert_on_fail: row.get(5)?,
    })
}

const POLICY_COLUMNS: &str = "service, max_response_time_ms, auto_repair_enabled, \
     repair_strategy, alert_on_warn, alert_on_fail";

impl Store {
    // ── Policies ──

    pub fn get_policy(&self, service: &str) -> Result<HealthPolicy> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POLICY_COLUMNS} FROM health_policies WHERE service = ?1"
        ))?;
        let mut rows = stmt.query_map(params![service], row_to_policy)?;
        rows.next().transpose()?.ok_or(Error::NotFound("policy"))
    }

    pub fn list_policies(&self) -> Result<Vec<HealthPolicy>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POLICY_COLUMNS} FROM health_policies ORDER BY service"
        ))?;
        let rows = stmt
            .query_map([], row_to_policy)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_policy(&self, policy: &HealthPolicy) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO health_policies \
             (service, max_response_time_ms, auto_repair_enabled, repair_strategy, alert_on_warn, alert_on_fail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(service) DO UPDATE SET \
                max_response_time_ms = excluded.max_response_time_ms, \
                auto_repair_enabled = excluded.auto_repair_enabled, \
                repair_strategy = excluded.repair_strategy, \
                alert_on_warn = excluded.alert_on_warn, \
                alert_on_fail = excluded.alert_on_fail, \
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
            params![
                policy.service,
                policy.max_response_time_ms,
                policy.auto_repair_enabled,
                policy.repair_strategy.as_str(),
                policy.alert_on_warn,
                policy.alert_on_fail,
            ],
        )?;
        Ok(())
    }

    /// Seed a default policy for every known service that has none yet.
    pub fn seed_default_policies(&self, services: &[String]) -> Result<u32> {
        let conn = self.lock();
        let mut seeded = 0;
        for service in services {
            let defaults = HealthPolicy::default_for(service);
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO health_policies \
                 (service, max_response_time_ms, auto_repair_enabled, repair_strategy, alert_on_warn, alert_on_fail) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    defaults.service,
                    defaults.max_response_time_ms,
                    defaults.auto_repair_enabled,
                    defaults.repair_strategy.as_str(),
                    defaults.alert_on_warn,
                    defaults.alert_on_fail,
                ],
            )?;
            seeded += inserted as u32;
        }
        Ok(seeded)
    }

    // ── Health checks ──

    /// Persist one run and its per-probe details in a single transaction.
    pub fn insert_health_check(
        &self,
        report: &HealthReport,
        trigger: &str,
        at: &DateTime<Utc>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let report_json = serde_json::to_string(&report.details)
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO health_checks \
             (id, created_at, status, duration_ms, total, passed, warned, failed, report, trigger) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                format_timestamp(at),
                report.status.as_str(),
                report.duration_ms,
                report.total,
                report.passed,
                report.warned,
                report.failed,
                report_json,
                trigger,
            ],
        )?;
        for detail in &report.details {
            let details_json = if detail.details.is_null() {
                None
            } else {
                Some(
                    serde_json::to_string(&detail.details)
                        .map_err(|e| Error::Storage(e.to_string()))?,
                )
            };
            tx.execute(
                "INSERT INTO health_check_details \
                 (check_id, name, status, message, duration_ms, details) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    detail.name,
                    detail.status.as_str(),
                    detail.message,
                    detail.duration_ms,
                    details_json,
                ],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn list_health_checks(&self, limit: u32) -> Result<Vec<HealthCheckRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, status, duration_ms, total, passed, warned, failed, trigger \
             FROM health_checks ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let created: String = row.get(1)?;
                let status: String = row.get(2)?;
                Ok((
                    HealthCheckRow {
                        id: row.get(0)?,
                        created_at: Utc::now(),
                        status: CheckStatus::parse(&status).unwrap_or(CheckStatus::Fail),
                        duration_ms: row.get(3)?,
                        total: row.get(4)?,
                        passed: row.get(5)?,
                        warned: row.get(6)?,
                        failed: row.get(7)?,
                        trigger: row.get(8)?,
                    },
                    created,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(mut row, created)| {
                row.created_at = parse_timestamp(&created)?;
                Ok(row)
            })
            .collect()
    }

    pub fn health_check_details(&self, check_id: &str) -> Result<Vec<CheckResult>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT name, status, message, duration_ms, details \
             FROM health_check_details WHERE check_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![check_id], |row| {
                let status: String = row.get(1)?;
                let details: Option<String> = row.get(4)?;
                Ok(CheckResult {
                    name: row.get(0)?,
                    status: CheckStatus::parse(&status).unwrap_or(CheckStatus::Fail),
                    message: row.get(2)?,
                    duration_ms: row.get(3)?,
                    details: details
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Hourly pass/warn/fail counts and mean probe duration for one service
    /// over the trailing window.
    pub fn health_trends(&self, service: &str, hours: u32) -> Result<Vec<TrendBucket>> {
        let since = Utc::now() - chrono::Duration::hours(hours as i64);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT substr(c.created_at, 1, 13) || ':00:00Z' AS hour, \
                    SUM(d.status = 'pass'), SUM(d.status = 'warn'), SUM(d.status = 'fail'), \
                    AVG(d.duration_ms) \
             FROM health_check_details d \
             JOIN health_checks c ON c.id = d.check_id \
             WHERE d.name = ?1 AND c.created_at >= ?2 \
             GROUP BY hour ORDER BY hour",
        )?;
        let rows = stmt
            .query_map(params![service, format_timestamp(&since)], |row| {
                Ok(TrendBucket {
                    hour: row.get(0)?,
                    passed: row.get(1)?,
                    warned: row.get(2)?,
                    failed: row.get(3)?,
                    avg_duration_ms: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Repairs ──

    pub fn insert_repair_pending(
        &self,
        check_id: Option<&str>,
        service: &str,
        issue_type: &str,
        action: RepairStrategy,
        trigger: &str,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO auto_repairs (id, created_at, check_id, service, issue_type, action, status, trigger) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                id,
                format_timestamp(&Utc::now()),
                check_id,
                service,
                issue_type,
                action.as_str(),
                trigger,
            ],
        )?;
        Ok(id)
    }

    pub fn finish_repair(
        &self,
        id: &str,
        succeeded: bool,
        error: Option<&str>,
        duration_ms: i64,
    ) -> Result<()> {
        let status = if succeeded { "succeeded" } else { "failed" };
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE auto_repairs SET status = ?2, error = ?3, duration_ms = ?4 WHERE id = ?1",
            params![id, status, error, duration_ms],
        )?;
        if updated == 0 {
            return Err(Error::NotFound("repair"));
        }
        Ok(())
    }

    pub fn get_repair(&self, id: &str) -> Result<AutoRepairRow> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, check_id, service, issue_type, action, status, error, duration_ms, trigger \
             FROM auto_repairs WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_repair)?;
        rows.next().transpose()?.ok_or(Error::NotFound("repair"))
    }

    pub fn list_repairs(&self, service: Option<&str>, limit: u32) -> Result<Vec<AutoRepairRow>> {
        let conn = self.lock();
        let rows = match service {
            Some(service) => {
                let mut stmt = conn.prepare(
                    "SELECT id, created_at, check_id, service, issue_type, action, status, error, duration_ms, trigger \
                     FROM auto_repairs WHERE service = ?1 ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![service, limit], row_to_repair)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, created_at, check_id, service, issue_type, action, status, error, duration_ms, trigger \
                     FROM auto_repairs ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], row_to_repair)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// When the most recent automatic repair for the service happened, for
    /// the scheduler's rate limit. Manual repairs do not count.
    pub fn last_auto_repair_at(&self, service: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let latest: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM auto_repairs WHERE service = ?1 AND trigger = 'auto'",
                params![service],
                |row| row.get(0),
            )
            .unwrap_or(None);
        latest.map(|s| parse_timestamp(&s)).transpose()
    }
}

fn row_to_repair(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutoRepairRow> {
    let created: String = row.get(1)?;
    let action: String = row.get(5)?;
    Ok(AutoRepairRow {
        id: row.get(0)?,
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        check_id: row.get(2)?,
        service: row.get(3)?,
        issue_type: row.get(4)?,
        action: RepairStrategy::parse(&action).unwrap_or(RepairStrategy::Restart),
        status: row.get(6)?,
        error: row.get(7)?,
        duration_ms: row.get(8)?,
        trigger: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn sample_report(status: CheckStatus) -> HealthReport {
        HealthReport::from_results(
            vec![CheckResult {
                name: "review".into(),
                status,
                message: "probe".into(),
                duration_ms: 42,
                details: serde_json::Value::Null,
            }],
            42,
        )
    }

    #[test]
    fn test_policy_seed_and_upsert() {
        let store = store();
        let services = vec!["portal".to_string(), "review".to_string()];
        assert_eq!(store.seed_default_policies(&services).unwrap(), 2);
        // Second seed is a no-op.
        assert_eq!(store.seed_default_policies(&services).unwrap(), 0);

        let mut policy = store.get_policy("review").unwrap();
        assert!(!policy.auto_repair_enabled);

        policy.auto_repair_enabled = true;
        policy.repair_strategy = RepairStrategy::Rebuild;
        store.upsert_policy(&policy).unwrap();

        let reread = store.get_policy("review").unwrap();
        assert!(reread.auto_repair_enabled);
        assert_eq!(reread.repair_strategy, RepairStrategy::Rebuild);
        assert_eq!(store.list_policies().unwrap().len(), 2);
    }

    #[test]
    fn test_check_persistence_with_details() {
        let store = store();
        let id = store
            .insert_health_check(&sample_report(CheckStatus::Fail), "scheduled", &Utc::now())
            .unwrap();

        let checks = store.list_health_checks(10).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, CheckStatus::Fail);
        assert_eq!(checks[0].failed, 1);

        let details = store.health_check_details(&id).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].name, "review");
    }

    #[test]
    fn test_repair_lifecycle() {
        let store = store();
        let check_id = store
            .insert_health_check(&sample_report(CheckStatus::Fail), "scheduled", &Utc::now())
            .unwrap();
        let repair_id = store
            .insert_repair_pending(
                Some(&check_id),
                "review",
                "health_check_failed",
                RepairStrategy::Restart,
                "auto",
            )
            .unwrap();

        let row = store.get_repair(&repair_id).unwrap();
        assert_eq!(row.status, "pending");

        store.finish_repair(&repair_id, true, None, 1200).unwrap();
        let row = store.get_repair(&repair_id).unwrap();
        assert_eq!(row.status, "succeeded");
        assert_eq!(row.duration_ms, Some(1200));

        assert!(store.last_auto_repair_at("review").unwrap().is_some());
        assert!(store.last_auto_repair_at("portal").unwrap().is_none());
    }

    #[test]
    fn test_manual_repairs_skip_rate_limit_lookup() {
        let store = store();
        let id = store
            .insert_repair_pending(None, "review", "operator", RepairStrategy::Rollback, "manual")
            .unwrap();
        store.finish_repair(&id, false, Some("orchestrator down"), 80).unwrap();
        assert!(store.last_auto_repair_at("review").unwrap().is_none());
        assert_eq!(store.list_repairs(Some("review"), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_trends_bucket_by_hour() {
        let store = store();
        for status in [CheckStatus::Pass, CheckStatus::Pass, CheckStatus::Fail] {
            store
                .insert_health_check(&sample_report(status), "scheduled", &Utc::now())
                .unwrap();
        }
        let buckets = store.health_trends("review", 24).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].passed, 2);
        assert_eq!(buckets[0].failed, 1);
    }
}
