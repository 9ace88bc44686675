//! Session validation against the platform session service.
//!
//! Contract: a token resolves to `(user_id, role)` or is rejected. When no
//! session service is configured every token is rejected and subscribers
//! stay anonymous; that fallback is loudly announced at startup.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{Error, Result};

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub role: String,
}

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Session>;
}

/// Delegates validation to the platform session service over HTTP.
pub struct HttpSessionService {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ValidateResponse {
    user_id: String,
    role: String,
}

#[async_trait]
impl SessionService for HttpSessionService {
    async fn validate(&self, token: &str) -> Result<Session> {
        let url = format!("{}/api/sessions/validate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("session service unreachable: {e}");
                Error::Unauthorized
            })?;
        if !response.status().is_success() {
            return Err(Error::Unauthorized);
        }
        let body: ValidateResponse = response.json().await.map_err(|_| Error::Unauthorized)?;
        Ok(Session {
            user_id: body.user_id,
            role: body.role,
        })
    }
}

/// Fallback used when `SESSION_SERVICE_URL` is unset: rejects every token.
pub struct AnonymousSessions;

#[async_trait]
impl SessionService for AnonymousSessions {
    async fn validate(&self, _token: &str) -> Result<Session> {
        Err(Error::Unauthorized)
    }
}

pub fn build_session_service(
    url: Option<&str>,
    client: reqwest::Client,
) -> Arc<dyn SessionService> {
    match url {
        Some(url) => {
            tracing::info!("session service configured at {url}");
            Arc::new(HttpSessionService {
                base_url: url.trim_end_matches('/').to_string(),
                client,
            })
        }
        None => {
            tracing::warn!(
                "SESSION_SERVICE_URL is not set: token validation is DISABLED and \
                 every client stays anonymous"
            );
            Arc::new(AnonymousSessions)
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Accepts exactly one token; everything else is rejected.
    pub struct StaticSessions {
        pub token: String,
        pub session: Session,
    }

    #[async_trait]
    impl SessionService for StaticSessions {
        async fn validate(&self, token: &str) -> Result<Session> {
            if token == self.token {
                Ok(self.session.clone())
            } else {
                Err(Error::Unauthorized)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_anonymous_rejects_all() {
        let svc = AnonymousSessions;
        assert!(svc.validate("any-token").await.is_err());
    }

    #[tokio::test]
    async fn test_static_sessions_for_tests() {
        let svc = testing::StaticSessions {
            token: "good".into(),
            session: Session {
                user_id: "u1".into(),
                role: "operator".into(),
            },
        };
        let session = svc.validate("good").await.unwrap();
        assert_eq!(session.user_id, "u1");
        assert!(svc.validate("bad").await.is_err());
    }
}
