//! HTTP client for a running bridge server.
//!
//! Every call carries its own timeout. Cache reads degrade to a miss,
//! everything else reports a classified [`BridgeError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::types::{AnalyzeResponse, CacheWriteResponse, ErrorBody, HealthResponse, SubmitRequest};
use crate::hash::short_hash;
use crate::poll::{QueryError, TaskSource};
use crate::task::TaskView;

pub const DEFAULT_BRIDGE_URL: &str = "http://localhost:3737";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const CACHE_READ_TIMEOUT: Duration = Duration::from_secs(3);
const CACHE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
const TASK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Bridge API Error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("Request to Bridge Server timed out after {0}ms")]
    Timeout(u64),

    #[error("Network Error connecting to Bridge Server: {0}")]
    Network(String),

    #[error("Invalid response from Bridge Server: {0}")]
    InvalidResponse(String),
}

impl BridgeError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BridgeError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }

    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            BridgeError::Timeout(timeout.as_millis() as u64)
        } else if err.is_decode() {
            BridgeError::InvalidResponse(err.to_string())
        } else {
            BridgeError::Network(err.to_string())
        }
    }
}

impl From<BridgeError> for QueryError {
    fn from(err: BridgeError) -> Self {
        if err.is_not_found() {
            QueryError::permanent(err.to_string())
        } else {
            QueryError::transient(err.to_string())
        }
    }
}

/// What an import needs from the analysis backend.
#[async_trait]
pub trait AnalysisBackend: TaskSource {
    /// Cached analysis for `hash`; any failure is a miss.
    async fn cached_analysis(&self, hash: &str) -> Option<Value>;

    /// Write an analysis (with `hash` or `content`) back to the shared cache.
    async fn store_analysis(&self, payload: &Value) -> Result<CacheWriteResponse, BridgeError>;

    async fn submit_analysis(&self, request: &SubmitRequest) -> Result<AnalyzeResponse, BridgeError>;
}

#[derive(Clone)]
pub struct BridgeClient {
    client: Client,
    base_url: String,
}

impl BridgeClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self, BridgeError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let value = format!("Bearer {}", key)
                .parse()
                .map_err(|_| BridgeError::Network("API key is not a valid header value".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<T, BridgeError> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BridgeError::from_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(parsed) => parsed.error,
                Err(_) if body.is_empty() => format!("HTTP Error {}", status.as_u16()),
                Err(_) => body,
            };
            return Err(BridgeError::Http {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BridgeError::from_reqwest(e, timeout))
    }

    pub async fn check_health(&self) -> Result<HealthResponse, BridgeError> {
        self.send(self.client.get(self.url("/api/health")), HEALTH_TIMEOUT)
            .await
    }

    pub async fn is_healthy(&self) -> bool {
        match self.check_health().await {
            Ok(_) => true,
            Err(e) => {
                warn!(url = %self.base_url, error = %e, "Bridge health check failed");
                false
            }
        }
    }

    /// Cached analysis by content hash. 404 is a normal miss, other failures
    /// are logged and treated as a miss.
    pub async fn get_cache(&self, hash: &str) -> Option<Value> {
        let request = self.client.get(self.url(&format!("/api/cache/{}", hash)));
        match self.send(request, CACHE_READ_TIMEOUT).await {
            Ok(value) => Some(value),
            Err(e) if e.is_not_found() => {
                debug!(hash = short_hash(hash), "Bridge cache miss");
                None
            }
            Err(e) => {
                warn!(hash = short_hash(hash), error = %e, "Bridge cache check failed");
                None
            }
        }
    }

    pub async fn sync_cache(&self, payload: &Value) -> Result<CacheWriteResponse, BridgeError> {
        let request = self.client.post(self.url("/api/cache")).json(payload);
        self.send(request, CACHE_WRITE_TIMEOUT).await
    }

    pub async fn submit_analysis(&self, request: &SubmitRequest) -> Result<AnalyzeResponse, BridgeError> {
        let request = self
            .client
            .post(self.url("/api/content/analyze"))
            .json(request);
        self.send(request, SUBMIT_TIMEOUT).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskView, BridgeError> {
        let request = self.client.get(self.url(&format!("/api/tasks/{}", task_id)));
        self.send(request, TASK_TIMEOUT).await
    }
}

#[async_trait]
impl TaskSource for BridgeClient {
    async fn fetch_task(&self, task_id: &str) -> Result<TaskView, QueryError> {
        Ok(self.get_task(task_id).await?)
    }
}

#[async_trait]
impl AnalysisBackend for BridgeClient {
    async fn cached_analysis(&self, hash: &str) -> Option<Value> {
        self.get_cache(hash).await
    }

    async fn store_analysis(&self, payload: &Value) -> Result<CacheWriteResponse, BridgeError> {
        self.sync_cache(payload).await
    }

    async fn submit_analysis(&self, request: &SubmitRequest) -> Result<AnalyzeResponse, BridgeError> {
        BridgeClient::submit_analysis(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn stub_server() -> String {
        let app = Router::new()
            .route(
                "/api/cache/:hash",
                get(|axum::extract::Path(hash): axum::extract::Path<String>| async move {
                    match hash.as_str() {
                        "hit" => (StatusCode::OK, Json(json!({"coreThesis": "t"}))),
                        "boom" => (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({"error": "Internal server error"})),
                        ),
                        _ => (StatusCode::NOT_FOUND, Json(json!({"error": "Cache miss"}))),
                    }
                }),
            )
            .route(
                "/api/tasks/:id",
                get(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": "Task not found"}))) }),
            )
            .route(
                "/api/health",
                get(|| async { "not json" }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_get_cache_hit_and_misses() {
        let client = BridgeClient::new(&stub_server().await, None).unwrap();
        assert_eq!(client.get_cache("hit").await, Some(json!({"coreThesis": "t"})));
        assert_eq!(client.get_cache("absent").await, None);
        assert_eq!(client.get_cache("boom").await, None);
    }

    #[tokio::test]
    async fn test_missing_task_is_permanent_for_polling() {
        let client = BridgeClient::new(&stub_server().await, None).unwrap();
        let err = client.get_task("nope").await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::Http {
                status: 404,
                message: "Task not found".into()
            }
        );

        let query = client.fetch_task("nope").await.unwrap_err();
        assert!(!query.retryable);
    }

    #[tokio::test]
    async fn test_invalid_body_is_classified() {
        let client = BridgeClient::new(&stub_server().await, None).unwrap();
        let err = client.check_health().await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = BridgeClient::new(&format!("http://{}", addr), Some("secret")).unwrap();
        let err = client.get_task("t1").await.unwrap_err();
        assert!(matches!(err, BridgeError::Network(_)));
        assert!(QueryError::from(err).retryable);
        assert!(!client.is_healthy().await);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BridgeError::Timeout(5000).to_string(),
            "Request to Bridge Server timed out after 5000ms"
        );
        assert_eq!(
            BridgeError::Http { status: 500, message: "x".into() }.to_string(),
            "Bridge API Error (500): x"
        );
    }
}
