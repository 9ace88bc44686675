use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named query string owned by a user. (user_id, name) is unique.
#[derive(Debug, Clone, Serialize)]
pub struct SavedSearch {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Principals this search has been shared with.
    pub shared_with: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SavedSearchRequest {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    pub principals: Vec<String>,
}

/// One executed query, append-only. Reads are deduplicated.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHistoryEntry {
    pub query: String,
    pub last_used_at: DateTime<Utc>,
}
