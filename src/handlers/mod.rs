pub mod health;
pub mod logs;
pub mod searches;
pub mod stream;

use axum::http::HeaderMap;

use crate::AppState;
use crate::auth::Session;
use crate::error::{Error, Result};

/// Pull a token out of the `Authorization` header, accepting both
/// `Bearer <token>` and a bare token.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Resolve the caller's session or reject with Unauthorized.
pub(crate) async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<Session> {
    let token = bearer_token(headers).ok_or(Error::Unauthorized)?;
    state.sessions.validate(&token).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_forms() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));

        headers.insert(axum::http::header::AUTHORIZATION, "rawtoken".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("rawtoken".to_string()));

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
