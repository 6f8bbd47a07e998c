//! Request and response bodies shared by the server routes and `BridgeClient`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `GET /api/health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    /// Same as `uptime_seconds`, kept for older clients
    #[serde(default)]
    pub uptime: u64,
    /// RFC 3339
    pub timestamp: String,
}

/// `POST /api/content/analyze` request
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub cache_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// `POST /api/content/analyze` response: either a cache hit with the
/// result inline, or a queued task to poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub task_id: Option<String>,
    pub content_hash: String,
    pub status: String,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl AnalyzeResponse {
    pub fn cached(content_hash: String, result: Value) -> Self {
        Self {
            task_id: None,
            content_hash,
            status: "cached".to_string(),
            cache_hit: true,
            result: Some(result),
        }
    }

    pub fn queued(task_id: String, content_hash: String) -> Self {
        Self {
            task_id: Some(task_id),
            content_hash,
            status: "queued".to_string(),
            cache_hit: false,
            result: None,
        }
    }
}

/// `POST /api/cache` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheWriteResponse {
    pub hash: String,
    pub cached: bool,
    pub created_at: i64,
}

/// Error body returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
