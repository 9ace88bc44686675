use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The slice of an entry that is fanned out to stream subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEvent {
    /// Field lookup used by subscriber filter evaluation (case-sensitive
    /// values).
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "service" => Some(&self.service),
            "level" => Some(&self.level),
            "message" => Some(&self.message),
            "correlation_id" => self.correlation_id.as_deref(),
            _ => None,
        }
    }
}

/// Server → client stream messages, discriminated by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Log {
        #[serde(flatten)]
        event: LogEvent,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    AuthSuccess {
        user_id: String,
        role: String,
    },
    AuthFailed {
        error: String,
    },
}

/// Client → server stream messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Filters { filters: HashMap<String, String> },
    Ping,
    Auth { token: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_message_flattens_entry() {
        let msg = ServerMessage::Log {
            event: LogEvent {
                id: 7,
                timestamp: Utc::now(),
                service: "portal".into(),
                level: "info".into(),
                message: "hi".into(),
                correlation_id: None,
                context: None,
            },
        };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "log");
        assert_eq!(v["id"], 7);
        assert_eq!(v["service"], "portal");
    }

    #[test]
    fn test_client_message_discriminator() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"filters","filters":{"service":"portal"}}"#).unwrap();
        assert!(matches!(m, ClientMessage::Filters { .. }));

        let m: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Ping));

        let m: ClientMessage = serde_json::from_str(r#"{"type":"auth","token":"t"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Auth { .. }));
    }
}
