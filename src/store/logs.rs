use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::HashMap;

use super::{Store, format_timestamp};
use crate::error::{Error, Result};
use crate::models::log::{CorrelationMetadata, Level, LogEntry, LogStats, NewLogEntry};
use crate::query::{SqlParam, SqlPredicate};

/// Hard cap on page size; also the cap used by the retention archive batch.
pub const MAX_LIMIT: u32 = 1_000;
pub const DEFAULT_LIMIT: u32 = 100;

const ENTRY_COLUMNS: &str = "id, timestamp, level, service, message, correlation_id, \
     trace_id, span_id, context, issue_category, severity_score";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

impl Order {
    fn dir(&self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// Query parameters for `query_entries`: optional simple filters, an
/// optional lowered DSL predicate, ordering, and a page.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub predicate: Option<SqlPredicate>,
    pub service: Option<String>,
    pub level: Option<Level>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub order: Order,
    pub limit: u32,
    pub offset: u32,
}

impl EntryQuery {
    pub fn new() -> Self {
        EntryQuery {
            limit: DEFAULT_LIMIT,
            ..Default::default()
        }
    }

    fn where_clause(&self) -> (String, Vec<SqlParam>) {
        let mut parts: Vec<String> = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(ref service) = self.service {
            parts.push("service = ?".into());
            params.push(SqlParam::Text(service.clone()));
        }
        if let Some(level) = self.level {
            parts.push("level = ?".into());
            params.push(SqlParam::Text(level.as_str().into()));
        }
        if let Some(ref from) = self.from {
            parts.push("timestamp >= ?".into());
            params.push(SqlParam::Text(format_timestamp(from)));
        }
        if let Some(ref to) = self.to {
            parts.push("timestamp <= ?".into());
            params.push(SqlParam::Text(format_timestamp(to)));
        }
        if let Some(ref pred) = self.predicate {
            parts.push(format!("({})", pred.clause));
            params.extend(pred.params.iter().cloned());
        }
        if parts.is_empty() {
            ("1=1".into(), params)
        } else {
            (parts.join(" AND "), params)
        }
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    fn corrupt(detail: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            detail.into(),
        )
    }

    let timestamp: String = row.get(1)?;
    let level: String = row.get(2)?;
    let context: Option<String> = row.get(8)?;

    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc),
        level: Level::parse(&level).ok_or_else(|| corrupt(format!("bad level {level:?}")))?,
        service: row.get(3)?,
        message: row.get(4)?,
        correlation_id: row.get(5)?,
        trace_id: row.get(6)?,
        span_id: row.get(7)?,
        context: context
            .map(|s| serde_json::from_str(&s).map_err(|e| corrupt(e.to_string())))
            .transpose()?,
        issue_category: row.get(9)?,
        severity_score: row.get(10)?,
    })
}

impl Store {
    /// Append one entry, returning its assigned id.
    pub fn insert_entry(&self, entry: &NewLogEntry) -> Result<i64> {
        let context = entry
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::validation(format!("context not serializable: {e}")))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO entries (timestamp, level, service, message, correlation_id, trace_id, span_id, context) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                format_timestamp(&entry.timestamp),
                entry.level.as_str(),
                entry.service,
                entry.message,
                entry.correlation_id,
                entry.trace_id,
                entry.span_id,
                context,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_entry(&self, id: i64) -> Result<LogEntry> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], row_to_entry)?;
        rows.next().transpose()?.ok_or(Error::NotFound("entry"))
    }

    /// Run a filtered, ordered, paginated query. Returns the page plus the
    /// total count of matching entries.
    pub fn query_entries(&self, q: &EntryQuery) -> Result<(Vec<LogEntry>, u64)> {
        let (where_clause, mut sql_params) = q.where_clause();
        let conn = self.lock();

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM entries WHERE {where_clause}"),
            rusqlite::params_from_iter(sql_params.iter()),
            |row| row.get(0),
        )?;

        let dir = q.order.dir();
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE {where_clause} \
             ORDER BY timestamp {dir}, id {dir} LIMIT ? OFFSET ?"
        );
        sql_params.push(SqlParam::Int(q.limit.min(MAX_LIMIT) as i64));
        sql_params.push(SqlParam::Int(q.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(rusqlite::params_from_iter(sql_params.iter()), row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((entries, total))
    }

    pub fn stats(&self) -> Result<LogStats> {
        let conn = self.lock();
        let total: u64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;

        let mut by_level = HashMap::new();
        let mut stmt = conn.prepare("SELECT level, COUNT(*) FROM entries GROUP BY level")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (level, count) = row?;
            by_level.insert(level, count);
        }

        let mut by_service = HashMap::new();
        let mut stmt = conn.prepare("SELECT service, COUNT(*) FROM entries GROUP BY service")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (service, count) = row?;
            by_service.insert(service, count);
        }

        Ok(LogStats {
            total,
            by_level,
            by_service,
        })
    }

    /// Delete all entries strictly older than the cutoff; returns the count.
    pub fn delete_before(&self, cutoff: &DateTime<Utc>) -> Result<u64> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM entries WHERE timestamp < ?1",
            params![format_timestamp(cutoff)],
        )?;
        Ok(deleted as u64)
    }

    /// Oldest-first batch of entries older than the cutoff, for archival.
    pub fn entries_older_than(&self, cutoff: &DateTime<Utc>, limit: u32) -> Result<Vec<LogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE timestamp < ?1 \
             ORDER BY timestamp ASC, id ASC LIMIT ?2"
        ))?;
        let entries = stmt
            .query_map(params![format_timestamp(cutoff), limit], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn correlated(&self, correlation_id: &str, limit: u32, offset: u32) -> Result<Vec<LogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE correlation_id = ?1 \
             ORDER BY timestamp ASC, id ASC LIMIT ?2 OFFSET ?3"
        ))?;
        let entries = stmt
            .query_map(
                params![correlation_id, limit.min(MAX_LIMIT), offset],
                row_to_entry,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn correlation_metadata(&self, correlation_id: &str) -> Result<CorrelationMetadata> {
        let conn = self.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE correlation_id = ?1",
            params![correlation_id],
            |row| row.get(0),
        )?;

        let mut services = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT service FROM entries WHERE correlation_id = ?1 ORDER BY service",
        )?;
        let rows = stmt.query_map(params![correlation_id], |row| row.get::<_, String>(0))?;
        for row in rows {
            services.push(row?);
        }

        let mut trace_ids = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT trace_id FROM entries \
             WHERE correlation_id = ?1 AND trace_id IS NOT NULL ORDER BY trace_id",
        )?;
        let rows = stmt.query_map(params![correlation_id], |row| row.get::<_, String>(0))?;
        for row in rows {
            trace_ids.push(row?);
        }

        Ok(CorrelationMetadata {
            correlation_id: correlation_id.to_string(),
            total,
            services,
            trace_ids,
        })
    }

    /// Strictly chronological (ascending) view of one correlation.
    pub fn correlation_timeline(&self, correlation_id: &str) -> Result<Vec<LogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE correlation_id = ?1 \
             ORDER BY timestamp ASC, id ASC"
        ))?;
        let entries = stmt
            .query_map(params![correlation_id], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Set the derived analysis fields. They are write-once: a second call
    /// for the same entry is a conflict.
    pub fn set_analysis(&self, id: i64, issue_category: &str, severity_score: i64) -> Result<()> {
        if !(1..=5).contains(&severity_score) {
            return Err(Error::validation("severity_score must be 1..=5"));
        }
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE entries SET issue_category = ?2, severity_score = ?3 \
             WHERE id = ?1 AND issue_category IS NULL AND severity_score IS NULL",
            params![id, issue_category, severity_score],
        )?;
        if updated > 0 {
            return Ok(());
        }
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM entries WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            Err(Error::Conflict("analysis fields already set".into()))
        } else {
            Err(Error::NotFound("entry"))
        }
    }

    /// Count entries for one service at the given levels since a point in
    /// time. Used by the alert engine's rate checks.
    pub fn count_entries_since(
        &self,
        service: &str,
        levels: &[Level],
        since: &DateTime<Utc>,
    ) -> Result<u64> {
        if levels.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; levels.len()].join(",");
        let mut sql_params: Vec<SqlParam> = vec![
            SqlParam::Text(service.to_string()),
            SqlParam::Text(format_timestamp(since)),
        ];
        sql_params.extend(
            levels
                .iter()
                .map(|l| SqlParam::Text(l.as_str().to_string())),
        );
        let conn = self.lock();
        let count = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM entries \
                 WHERE service = ?1 AND timestamp >= ?2 AND level IN ({placeholders})"
            ),
            rusqlite::params_from_iter(sql_params.iter()),
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::IngestRequest;
    use crate::query::compile;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn insert(store: &Store, service: &str, level: &str, message: &str) -> i64 {
        let req = IngestRequest {
            service: service.into(),
            level: level.into(),
            message: message.into(),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            context: None,
            timestamp: None,
        };
        store
            .insert_entry(&req.into_entry(Utc::now()).unwrap())
            .unwrap()
    }

    #[test]
    fn test_insert_get_round_trip() {
        let store = store();
        let id = insert(&store, "portal", "info", "User logged in");
        let entry = store.get_entry(id).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.service, "portal");
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.message, "User logged in");
    }

    #[test]
    fn test_ids_monotonic() {
        let store = store();
        let mut last = 0;
        for i in 0..10 {
            let id = insert(&store, "portal", "info", &format!("event {i}"));
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = store();
        assert!(matches!(store.get_entry(999), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_query_by_service_and_level() {
        let store = store();
        for _ in 0..5 {
            insert(&store, "portal", "info", "ok");
        }
        for _ in 0..3 {
            insert(&store, "review", "error", "boom");
        }

        let mut q = EntryQuery::new();
        q.service = Some("portal".into());
        let (entries, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 5);
        assert_eq!(entries.len(), 5);

        let mut q = EntryQuery::new();
        q.level = Some(Level::Error);
        let (_, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_query_with_dsl_predicate() {
        let store = store();
        insert(&store, "portal", "info", "login ok");
        insert(&store, "portal", "error", "login failed");
        insert(&store, "review", "warn", "slow");

        let mut q = EntryQuery::new();
        q.predicate = Some(compile("service:portal AND (level:error OR level:warn)").unwrap());
        let (entries, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].level, Level::Error);
    }

    #[test]
    fn test_predicate_agrees_with_expected_matches() {
        // Property: an entry is returned iff the predicate holds on it.
        let store = store();
        let data = [
            ("portal", "info", "user login"),
            ("portal", "error", "db timeout"),
            ("review", "error", "oom"),
            ("review", "info", "ready"),
            ("billing", "warn", "slow query timeout"),
        ];
        for (s, l, m) in data {
            insert(&store, s, l, m);
        }

        let mut q = EntryQuery::new();
        q.predicate = Some(compile("timeout AND NOT service:portal").unwrap());
        let (entries, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].service, "billing");
    }

    #[test]
    fn test_free_text_matches_message_words() {
        let store = store();
        insert(&store, "portal", "info", "connection refused by upstream");
        insert(&store, "portal", "info", "connection accepted");

        let mut q = EntryQuery::new();
        q.predicate = Some(compile("\"connection refused\"").unwrap());
        let (_, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_regex_predicate() {
        let store = store();
        insert(&store, "portal", "info", "request timed out after 5s");
        insert(&store, "portal", "info", "request completed");

        let mut q = EntryQuery::new();
        q.predicate = Some(compile("/timed.?out/").unwrap());
        let (_, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_tags_containment() {
        let store = store();
        let req = IngestRequest {
            service: "billing".into(),
            level: "info".into(),
            message: "invoice".into(),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            context: Some(serde_json::json!({"tags": ["money", "invoice"]})),
            timestamp: None,
        };
        store
            .insert_entry(&req.into_entry(Utc::now()).unwrap())
            .unwrap();
        insert(&store, "billing", "info", "no tags here");

        let mut q = EntryQuery::new();
        q.predicate = Some(compile("tags:money").unwrap());
        let (_, total) = store.query_entries(&q).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_ordering_and_pagination_concatenate() {
        let store = store();
        for i in 0..25 {
            insert(&store, "portal", "info", &format!("event {i}"));
        }

        let mut whole = EntryQuery::new();
        whole.limit = 1000;
        let (all, _) = store.query_entries(&whole).unwrap();

        let mut paged = Vec::new();
        for page in 0..5 {
            let mut q = EntryQuery::new();
            q.limit = 5;
            q.offset = page * 5;
            let (entries, _) = store.query_entries(&q).unwrap();
            paged.extend(entries);
        }

        let all_ids: Vec<i64> = all.iter().map(|e| e.id).collect();
        let paged_ids: Vec<i64> = paged.iter().map(|e| e.id).collect();
        assert_eq!(all_ids, paged_ids);

        // Default descending: newest (highest id for equal timestamps) first.
        let mut sorted = all_ids.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(all_ids, sorted);
    }

    #[test]
    fn test_stats_aggregation() {
        let store = store();
        insert(&store, "portal", "info", "a");
        insert(&store, "portal", "info", "b");
        insert(&store, "portal", "error", "c");
        insert(&store, "review", "error", "d");
        insert(&store, "review", "warn", "e");

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_level["info"], 2);
        assert_eq!(stats.by_level["error"], 2);
        assert_eq!(stats.by_level["warn"], 1);
        assert_eq!(stats.by_service["portal"], 3);
        assert_eq!(stats.by_service["review"], 2);
    }

    #[test]
    fn test_delete_before_counts_exactly() {
        let store = store();
        let now = Utc::now();
        for age_days in [1, 10, 40, 60] {
            let req = IngestRequest {
                service: "portal".into(),
                level: "info".into(),
                message: "old".into(),
                correlation_id: None,
                trace_id: None,
                span_id: None,
                context: None,
                timestamp: Some(now - chrono::Duration::days(age_days)),
            };
            store
                .insert_entry(&req.into_entry(now).unwrap())
                .unwrap();
        }

        let cutoff = now - chrono::Duration::days(30);
        let deleted = store.delete_before(&cutoff).unwrap();
        assert_eq!(deleted, 2);

        let (remaining, total) = store.query_entries(&EntryQuery::new()).unwrap();
        assert_eq!(total, 2);
        assert!(remaining.iter().all(|e| e.timestamp >= cutoff));
    }

    #[test]
    fn test_correlation_views() {
        let store = store();
        let now = Utc::now();
        for (i, service) in ["portal", "review", "portal"].iter().enumerate() {
            let req = IngestRequest {
                service: (*service).into(),
                level: "info".into(),
                message: format!("step {i}"),
                correlation_id: Some("req-123".into()),
                trace_id: Some(format!("trace-{}", i % 2)),
                span_id: None,
                context: None,
                timestamp: Some(now + chrono::Duration::milliseconds(i as i64)),
            };
            store
                .insert_entry(&req.into_entry(now + chrono::Duration::seconds(10)).unwrap())
                .unwrap();
        }
        insert(&store, "other", "info", "unrelated");

        let timeline = store.correlation_timeline("req-123").unwrap();
        assert_eq!(timeline.len(), 3);
        assert!(timeline.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let meta = store.correlation_metadata("req-123").unwrap();
        assert_eq!(meta.total, 3);
        assert_eq!(meta.services, vec!["portal", "review"]);
        assert_eq!(meta.trace_ids.len(), 2);

        let page = store.correlated("req-123", 2, 1).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message, "step 1");
    }

    #[test]
    fn test_analysis_set_once() {
        let store = store();
        let id = insert(&store, "portal", "error", "boom");
        store.set_analysis(id, "database", 4).unwrap();

        let entry = store.get_entry(id).unwrap();
        assert_eq!(entry.issue_category.as_deref(), Some("database"));
        assert_eq!(entry.severity_score, Some(4));

        assert!(matches!(
            store.set_analysis(id, "network", 2),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            store.set_analysis(9999, "x", 3),
            Err(Error::NotFound(_))
        ));
        assert!(store.set_analysis(id, "x", 9).is_err());
    }

    #[test]
    fn test_count_entries_since() {
        let store = store();
        insert(&store, "portal", "error", "a");
        insert(&store, "portal", "fatal", "b");
        insert(&store, "portal", "info", "c");

        let since = Utc::now() - chrono::Duration::minutes(1);
        let errors = store
            .count_entries_since(
                "portal",
                &[Level::Error, Level::Critical, Level::Fatal],
                &since,
            )
            .unwrap();
        assert_eq!(errors, 2);
    }
}
