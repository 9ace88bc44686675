use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Error;

/// Maximum allowed length of the producer service name.
pub const MAX_SERVICE_LEN: usize = 64;
/// Maximum allowed length of the message body (64 KiB).
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;
/// Maximum allowed length of a correlation identifier.
pub const MAX_CORRELATION_LEN: usize = 128;
/// Tolerated clock skew before a future timestamp is clamped to server now.
pub const CLOCK_SKEW_SECS: i64 = 5;

/// Severity level. `fatal` is a distinct sixth level, not an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Fatal,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Critical,
        Level::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Level> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "critical" => Some(Level::Critical),
            "fatal" => Some(Level::Fatal),
            _ => None,
        }
    }

    /// Error-class levels counted by the alert engine's error-rate check.
    pub fn is_error_class(&self) -> bool {
        matches!(self, Level::Error | Level::Critical | Level::Fatal)
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub service: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_score: Option<i64>,
}

/// Incoming entry as POSTed by a producer. Timestamp is optional and
/// server-assigned when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub service: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A validated entry ready for insertion (no id yet).
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub service: String,
    pub message: String,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub context: Option<serde_json::Value>,
}

impl IngestRequest {
    /// Validate field presence and bounds, assign/clamp the timestamp.
    pub fn into_entry(self, now: DateTime<Utc>) -> Result<NewLogEntry, Error> {
        if self.service.trim().is_empty() {
            return Err(Error::validation("service is required"));
        }
        if self.service.len() > MAX_SERVICE_LEN {
            return Err(Error::validation(format!(
                "service exceeds {MAX_SERVICE_LEN} characters"
            )));
        }
        if self.message.is_empty() {
            return Err(Error::validation("message is required"));
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(Error::validation(format!(
                "message exceeds {MAX_MESSAGE_LEN} bytes"
            )));
        }
        let level = Level::parse(&self.level)
            .ok_or_else(|| Error::validation(format!("invalid level: {}", self.level)))?;
        if let Some(ref cid) = self.correlation_id {
            if cid.len() > MAX_CORRELATION_LEN {
                return Err(Error::validation(format!(
                    "correlation_id exceeds {MAX_CORRELATION_LEN} characters"
                )));
            }
        }
        if let Some(ref ctx) = self.context {
            if !ctx.is_object() {
                return Err(Error::validation("context must be a JSON object"));
            }
        }

        let timestamp = match self.timestamp {
            Some(ts) if ts > now + chrono::Duration::seconds(CLOCK_SKEW_SECS) => now,
            Some(ts) => ts,
            None => now,
        };

        Ok(NewLogEntry {
            timestamp,
            level,
            service: self.service,
            message: self.message,
            correlation_id: self.correlation_id.filter(|c| !c.is_empty()),
            trace_id: self.trace_id.filter(|t| !t.is_empty()),
            span_id: self.span_id.filter(|s| !s.is_empty()),
            context: self.context,
        })
    }
}

/// Aggregated store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub total: u64,
    pub by_level: HashMap<String, u64>,
    pub by_service: HashMap<String, u64>,
}

/// Aggregated metadata for one correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationMetadata {
    pub correlation_id: String,
    pub total: u64,
    pub services: Vec<String>,
    pub trace_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> IngestRequest {
        IngestRequest {
            service: "portal".into(),
            level: "info".into(),
            message: "User logged in".into(),
            correlation_id: None,
            trace_id: None,
            span_id: None,
            context: None,
            timestamp: None,
        }
    }

    #[test]
    fn test_level_round_trip() {
        for level in Level::ALL {
            assert_eq!(Level::parse(level.as_str()), Some(level));
        }
        assert_eq!(Level::parse("FATAL"), Some(Level::Fatal));
        assert_eq!(Level::parse("trace"), None);
    }

    #[test]
    fn test_missing_service_rejected() {
        let mut req = base_request();
        req.service = "  ".into();
        assert!(req.into_entry(Utc::now()).is_err());
    }

    #[test]
    fn test_oversized_fields_rejected() {
        let now = Utc::now();

        let mut req = base_request();
        req.service = "s".repeat(MAX_SERVICE_LEN + 1);
        assert!(req.into_entry(now).is_err());

        let mut req = base_request();
        req.message = "m".repeat(MAX_MESSAGE_LEN + 1);
        assert!(req.into_entry(now).is_err());

        let mut req = base_request();
        req.correlation_id = Some("c".repeat(MAX_CORRELATION_LEN + 1));
        assert!(req.into_entry(now).is_err());
    }

    #[test]
    fn test_future_timestamp_clamped() {
        let now = Utc::now();
        let mut req = base_request();
        req.timestamp = Some(now + chrono::Duration::seconds(120));
        let entry = req.into_entry(now).unwrap();
        assert_eq!(entry.timestamp, now);

        // Inside the skew tolerance the timestamp is kept as-is.
        let mut req = base_request();
        let near = now + chrono::Duration::seconds(3);
        req.timestamp = Some(near);
        let entry = req.into_entry(now).unwrap();
        assert_eq!(entry.timestamp, near);
    }

    #[test]
    fn test_missing_timestamp_assigned() {
        let now = Utc::now();
        let entry = base_request().into_entry(now).unwrap();
        assert_eq!(entry.timestamp, now);
    }

    #[test]
    fn test_non_object_context_rejected() {
        let mut req = base_request();
        req.context = Some(serde_json::json!([1, 2, 3]));
        assert!(req.into_entry(Utc::now()).is_err());
    }
}
