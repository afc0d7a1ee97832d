//! Optional gate on privileged routes
//!
//! Authentication lives outside the orchestrator. The server only asks an
//! injected `PermissionChecker`, and with none installed every request is
//! allowed.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use serde::Serialize;
use std::fmt;

use crate::error::ApiError;

/// Routes that change orchestration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegedAction {
    Submit,
    Abort,
    Replay,
}

impl fmt::Display for PrivilegedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrivilegedAction::Submit => "submit",
            PrivilegedAction::Abort => "abort",
            PrivilegedAction::Replay => "replay",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// `Ok` to let the request through
    async fn check(&self, action: PrivilegedAction, headers: &HeaderMap) -> Result<(), ApiError>;
}

/// Accepts requests carrying `Authorization: Bearer <token>`
pub struct StaticTokenChecker {
    token: String,
}

impl StaticTokenChecker {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl PermissionChecker for StaticTokenChecker {
    async fn check(&self, action: PrivilegedAction, headers: &HeaderMap) -> Result<(), ApiError> {
        let presented = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
        if presented != self.token {
            return Err(ApiError::Forbidden(action.to_string()));
        }
        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(value) = auth {
            map.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[tokio::test]
    async fn test_static_token() {
        let checker = StaticTokenChecker::new("s3cret");
        assert!(checker
            .check(PrivilegedAction::Abort, &headers(Some("Bearer s3cret")))
            .await
            .is_ok());
        assert!(matches!(
            checker.check(PrivilegedAction::Abort, &headers(None)).await,
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            checker
                .check(PrivilegedAction::Replay, &headers(Some("Bearer nope")))
                .await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            checker
                .check(PrivilegedAction::Submit, &headers(Some("Basic s3cret")))
                .await,
            Err(ApiError::Unauthorized)
        ));
    }
}
