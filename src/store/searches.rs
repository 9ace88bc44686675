use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{Store, format_timestamp, parse_timestamp};
use crate::error::{Error, Result};
use crate::models::alert::{AlertConfig, AlertRow, ApiMetric, ApiMetricsSnapshot};
use crate::models::search::{SavedSearch, SearchHistoryEntry};

/// Maximum deduplicated history entries returned per user.
const HISTORY_LIMIT: u32 = 50;

impl Store {
    // ── Saved searches ──

    pub fn create_saved_search(&self, user_id: &str, name: &str, query: &str) -> Result<SavedSearch> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO saved_searches (id, user_id, name, query, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, user_id, name, query, format_timestamp(&now)],
        );
        match result {
            Ok(_) => Ok(SavedSearch {
                id,
                user_id: user_id.to_string(),
                name: name.to_string(),
                query: query.to_string(),
                created_at: now,
                updated_at: now,
                shared_with: Vec::new(),
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Conflict(format!(
                    "saved search {name:?} already exists"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Searches the user owns plus those shared with them.
    pub fn list_saved_searches(&self, user_id: &str) -> Result<Vec<SavedSearch>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.id, s.user_id, s.name, s.query, s.created_at, s.updated_at \
             FROM saved_searches s \
             LEFT JOIN search_shares sh ON sh.search_id = s.id \
             WHERE s.user_id = ?1 OR sh.principal = ?1 \
             ORDER BY s.updated_at DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id], row_to_search)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut searches = Vec::with_capacity(rows.len());
        for (search, created, updated) in rows {
            searches.push(self.hydrate_search(&conn, search, &created, &updated)?);
        }
        Ok(searches)
    }

    pub fn get_saved_search(&self, id: &str) -> Result<SavedSearch> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, query, created_at, updated_at \
             FROM saved_searches WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_search)?;
        let (search, created, updated) =
            rows.next().transpose()?.ok_or(Error::NotFound("search"))?;
        self.hydrate_search(&conn, search, &created, &updated)
    }

    pub fn update_saved_search(
        &self,
        id: &str,
        user_id: &str,
        name: &str,
        query: &str,
    ) -> Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE saved_searches SET name = ?3, query = ?4, updated_at = ?5 \
             WHERE id = ?1 AND user_id = ?2",
            params![id, user_id, name, query, format_timestamp(&Utc::now())],
        )?;
        Ok(count > 0)
    }

    pub fn delete_saved_search(&self, id: &str, user_id: &str) -> Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM saved_searches WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(count > 0)
    }

    pub fn share_saved_search(&self, id: &str, principals: &[String]) -> Result<()> {
        let conn = self.lock();
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM saved_searches WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::NotFound("search"));
        }
        for principal in principals {
            conn.execute(
                "INSERT OR IGNORE INTO search_shares (search_id, principal) VALUES (?1, ?2)",
                params![id, principal],
            )?;
        }
        Ok(())
    }

    fn hydrate_search(
        &self,
        conn: &rusqlite::Connection,
        mut search: SavedSearch,
        created: &str,
        updated: &str,
    ) -> Result<SavedSearch> {
        search.created_at = parse_timestamp(created)?;
        search.updated_at = parse_timestamp(updated)?;
        let mut stmt = conn.prepare(
            "SELECT principal FROM search_shares WHERE search_id = ?1 ORDER BY principal",
        )?;
        let rows = stmt.query_map(params![search.id], |row| row.get::<_, String>(0))?;
        for row in rows {
            search.shared_with.push(row?);
        }
        Ok(search)
    }

    // ── Search history ──

    pub fn append_search_history(&self, user_id: &str, query: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO search_history (user_id, query, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, query, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    /// History deduplicated on read: one row per distinct query, keeping the
    /// most recent use, newest first.
    pub fn search_history(&self, user_id: &str) -> Result<Vec<SearchHistoryEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT query, MAX(created_at) AS last_used \
             FROM search_history WHERE user_id = ?1 \
             GROUP BY query ORDER BY last_used DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, HISTORY_LIMIT], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(query, last_used)| {
                Ok(SearchHistoryEntry {
                    query,
                    last_used_at: parse_timestamp(&last_used)?,
                })
            })
            .collect()
    }

    // ── Alert configuration ──

    pub fn upsert_alert_config(&self, config: &AlertConfig) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO alert_configs \
             (service, error_rate_per_minute, warn_rate_per_minute, email, webhook_url, enabled) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(service) DO UPDATE SET \
                error_rate_per_minute = excluded.error_rate_per_minute, \
                warn_rate_per_minute = excluded.warn_rate_per_minute, \
                email = excluded.email, \
                webhook_url = excluded.webhook_url, \
                enabled = excluded.enabled",
            params![
                config.service,
                config.error_rate_per_minute,
                config.warn_rate_per_minute,
                config.email,
                config.webhook_url,
                config.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn get_alert_config(&self, service: &str) -> Result<AlertConfig> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT service, error_rate_per_minute, warn_rate_per_minute, email, webhook_url, enabled \
             FROM alert_configs WHERE service = ?1",
        )?;
        let mut rows = stmt.query_map(params![service], row_to_alert_config)?;
        rows.next()
            .transpose()?
            .ok_or(Error::NotFound("alert config"))
    }

    pub fn list_alert_configs(&self, enabled_only: bool) -> Result<Vec<AlertConfig>> {
        let conn = self.lock();
        let sql = if enabled_only {
            "SELECT service, error_rate_per_minute, warn_rate_per_minute, email, webhook_url, enabled \
             FROM alert_configs WHERE enabled = 1 ORDER BY service"
        } else {
            "SELECT service, error_rate_per_minute, warn_rate_per_minute, email, webhook_url, enabled \
             FROM alert_configs ORDER BY service"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], row_to_alert_config)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Alerts (alert engine is the sole writer) ──

    pub fn insert_alert(
        &self,
        service: &str,
        kind: &str,
        message: &str,
        value: f64,
        threshold: f64,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO alerts (id, created_at, service, kind, message, value, threshold) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                format_timestamp(&Utc::now()),
                service,
                kind,
                message,
                value,
                threshold,
            ],
        )?;
        Ok(id)
    }

    pub fn list_alerts(&self, limit: u32) -> Result<Vec<AlertRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, service, kind, message, value, threshold \
             FROM alerts ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let created: String = row.get(1)?;
                Ok((
                    AlertRow {
                        id: row.get(0)?,
                        created_at: Utc::now(),
                        service: row.get(2)?,
                        kind: row.get(3)?,
                        message: row.get(4)?,
                        value: row.get(5)?,
                        threshold: row.get(6)?,
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

    // ── API metrics ──

    pub fn insert_api_metrics(&self, batch: &[ApiMetric]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for metric in batch {
            tx.execute(
                "INSERT INTO api_metrics (recorded_at, method, path, status, duration_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    format_timestamp(&metric.recorded_at),
                    metric.method,
                    metric.path,
                    metric.status,
                    metric.duration_ms,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Request/5xx counts since a point in time, read by the alert engine.
    pub fn api_metrics_snapshot(&self, since: &DateTime<Utc>) -> Result<ApiMetricsSnapshot> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status >= 500), 0) \
             FROM api_metrics WHERE recorded_at >= ?1",
            params![format_timestamp(since)],
            |row| {
                Ok(ApiMetricsSnapshot {
                    requests: row.get(0)?,
                    server_errors: row.get(1)?,
                })
            },
        )
        .map_err(Into::into)
    }
}

type SearchRow = (SavedSearch, String, String);

fn row_to_search(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchRow> {
    Ok((
        SavedSearch {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            query: row.get(3)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            shared_with: Vec::new(),
        },
        row.get(4)?,
        row.get(5)?,
    ))
}

fn row_to_alert_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertConfig> {
    Ok(AlertConfig {
        service: row.get(0)?,
        error_rate_per_minute: row.get(1)?,
        warn_rate_per_minute: row.get(2)?,
        email: row.get(3)?,
        webhook_url: row.get(4)?,
        enabled: row.get(5)?,
    })
}
