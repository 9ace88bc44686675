//! Embedded relational store. Owns every durable entity: log entries,
//! health checks and policies, repairs, alert configuration, saved
//! searches, and API metrics.

mod health;
mod logs;
mod searches;

pub use logs::{EntryQuery, Order};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Stored timestamps are fixed-width RFC3339 with nanosecond precision so
/// lexicographic order equals chronological order.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format(TS_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("corrupt timestamp {s:?}: {e}")))
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Storage(e.to_string()))?;
        register_regexp(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Liveness probe used by the database health checker.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS entries (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp      TEXT NOT NULL,
                level          TEXT NOT NULL CHECK(level IN ('debug','info','warn','error','critical','fatal')),
                service        TEXT NOT NULL,
                message        TEXT NOT NULL,
                correlation_id TEXT,
                trace_id       TEXT,
                span_id        TEXT,
                context        TEXT,
                issue_category TEXT,
                severity_score INTEGER CHECK(severity_score BETWEEN 1 AND 5)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_service ON entries(service);
            CREATE INDEX IF NOT EXISTS idx_entries_level ON entries(level);
            CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_entries_correlation ON entries(correlation_id)
                WHERE correlation_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_entries_category ON entries(issue_category)
                WHERE issue_category IS NOT NULL;

            CREATE VIRTUAL TABLE IF NOT EXISTS log_fts USING fts5(
                service, level, message,
                content='entries', content_rowid='id'
            );
            CREATE TRIGGER IF NOT EXISTS entries_fts_insert AFTER INSERT ON entries BEGIN
                INSERT INTO log_fts(rowid, service, level, message)
                VALUES (new.id, new.service, new.level, new.message);
            END;
            CREATE TRIGGER IF NOT EXISTS entries_fts_delete AFTER DELETE ON entries BEGIN
                INSERT INTO log_fts(log_fts, rowid, service, level, message)
                VALUES ('delete', old.id, old.service, old.level, old.message);
            END;

            CREATE TABLE IF NOT EXISTS health_policies (
                service              TEXT PRIMARY KEY,
                max_response_time_ms INTEGER NOT NULL DEFAULT 2000,
                auto_repair_enabled  INTEGER NOT NULL DEFAULT 0,
                repair_strategy      TEXT NOT NULL DEFAULT 'restart'
                                     CHECK(repair_strategy IN ('restart','rebuild','rollback')),
                alert_on_warn        INTEGER NOT NULL DEFAULT 0,
                alert_on_fail        INTEGER NOT NULL DEFAULT 1,
                updated_at           TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS health_checks (
                id          TEXT PRIMARY KEY,
                created_at  TEXT NOT NULL,
                status      TEXT NOT NULL CHECK(status IN ('pass','warn','fail')),
                duration_ms INTEGER NOT NULL,
                total       INTEGER NOT NULL,
                passed      INTEGER NOT NULL,
                warned      INTEGER NOT NULL,
                failed      INTEGER NOT NULL,
                report      TEXT NOT NULL,
                trigger     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_health_checks_created ON health_checks(created_at DESC);

            CREATE TABLE IF NOT EXISTS health_check_details (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                check_id    TEXT NOT NULL REFERENCES health_checks(id) ON DELETE CASCADE,
                name        TEXT NOT NULL,
                status      TEXT NOT NULL CHECK(status IN ('pass','warn','fail')),
                message     TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                details     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_health_details_check ON health_check_details(check_id);
            CREATE INDEX IF NOT EXISTS idx_health_details_name ON health_check_details(name);

            CREATE TABLE IF NOT EXISTS auto_repairs (
                id          TEXT PRIMARY KEY,
                created_at  TEXT NOT NULL,
                check_id    TEXT REFERENCES health_checks(id) ON DELETE SET NULL,
                service     TEXT NOT NULL,
                issue_type  TEXT NOT NULL,
                action      TEXT NOT NULL CHECK(action IN ('restart','rebuild','rollback')),
                status      TEXT NOT NULL CHECK(status IN ('pending','succeeded','failed')),
                error       TEXT,
                duration_ms INTEGER,
                trigger     TEXT NOT NULL DEFAULT 'auto' CHECK(trigger IN ('auto','manual'))
            );
            CREATE INDEX IF NOT EXISTS idx_auto_repairs_service ON auto_repairs(service, created_at DESC);

            CREATE TABLE IF NOT EXISTS alert_configs (
                service               TEXT PRIMARY KEY,
                error_rate_per_minute INTEGER NOT NULL,
                warn_rate_per_minute  INTEGER NOT NULL,
                email                 TEXT,
                webhook_url           TEXT,
                enabled               INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id         TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                service    TEXT NOT NULL,
                kind       TEXT NOT NULL,
                message    TEXT NOT NULL,
                value      REAL NOT NULL,
                threshold  REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at DESC);

            CREATE TABLE IF NOT EXISTS api_metrics (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                method      TEXT NOT NULL,
                path        TEXT NOT NULL,
                status      INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_metrics_recorded ON api_metrics(recorded_at DESC);

            CREATE TABLE IF NOT EXISTS saved_searches (
                id         TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL,
                name       TEXT NOT NULL,
                query      TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, name)
            );

            CREATE TABLE IF NOT EXISTS search_shares (
                search_id TEXT NOT NULL REFERENCES saved_searches(id) ON DELETE CASCADE,
                principal TEXT NOT NULL,
                UNIQUE(search_id, principal)
            );

            CREATE TABLE IF NOT EXISTS search_history (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    TEXT NOT NULL,
                query      TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_search_history_user ON search_history(user_id, created_at DESC);
            ",
        )?;
        Ok(())
    }
}

/// Register a `regexp(pattern, text)` scalar backed by the regex crate so
/// lowered `REGEXP` predicates work. The compiled regex is cached per
/// prepared statement via auxiliary data.
fn register_regexp(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: std::sync::Arc<Regex> = ctx.get_or_create_aux(0, |vr| {
                Ok::<_, Box<dyn std::error::Error + Send + Sync + 'static>>(Regex::new(
                    vr.as_str()?,
                )?)
            })?;
            let text = ctx
                .get_raw(1)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(re.is_match(text))
        },
    )
    .map_err(|e| Error::Storage(e.to_string()))
}
