use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::api::ApiError;

/// Routes that do not require authentication
const AUTH_WHITELIST: &[&str] = &["/api/health"];

/// Only these prefixes are protected
const PROTECTED_PREFIX: &str = "/api/";

/// Bearer-token check against a single configured key.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuth {
    key: Option<String>,
}

impl ApiKeyAuth {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    fn check(&self, authorization: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = &self.key else {
            return Ok(());
        };

        let token = authorization
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                ApiError::Unauthorized("Unauthorized: Missing or invalid token format".into())
            })?;

        if token != expected {
            return Err(ApiError::Unauthorized("Unauthorized: Invalid API key".into()));
        }
        Ok(())
    }
}

/// Extract the bearer token from a request, if any.
pub fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn auth_middleware(
    State(auth): State<Arc<ApiKeyAuth>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();

    if !path.starts_with(PROTECTED_PREFIX) || AUTH_WHITELIST.iter().any(|w| path.starts_with(w)) {
        return Ok(next.run(request).await);
    }

    if !auth.is_enabled() {
        tracing::debug!(path, "No API key configured, request not authenticated");
        return Ok(next.run(request).await);
    }

    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = auth.check(authorization) {
        tracing::debug!(path, "Rejected unauthenticated request");
        return Err(e);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_allows_everything() {
        let auth = ApiKeyAuth::new(Some(String::new()));
        assert!(!auth.is_enabled());
        assert!(auth.check(None).is_ok());
    }

    #[test]
    fn test_bearer_check() {
        let auth = ApiKeyAuth::new(Some("secret".into()));
        assert!(auth.check(Some("Bearer secret")).is_ok());

        let missing = auth.check(None).unwrap_err();
        assert_eq!(missing.to_string(), "Unauthorized: Missing or invalid token format");

        let wrong_scheme = auth.check(Some("Basic secret")).unwrap_err();
        assert_eq!(wrong_scheme.to_string(), "Unauthorized: Missing or invalid token format");

        let wrong = auth.check(Some("Bearer nope")).unwrap_err();
        assert_eq!(wrong.to_string(), "Unauthorized: Invalid API key");
    }
}
