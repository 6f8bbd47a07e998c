use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::error::ApiError;
use super::server::AppState;
use super::types::{AnalyzeResponse, CacheWriteResponse, HealthResponse};
use crate::analysis::{AnalyzeRequest, Submission};
use crate::cache::CacheStatsSnapshot;
use crate::hash::short_hash;
use crate::task::TaskView;

/// Body of `POST /api/cache`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheWriteRequest {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    core_thesis: Option<Value>,
    #[serde(default)]
    chunks: Option<Value>,
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    summary: Option<Value>,
    #[serde(default)]
    title: Option<Value>,
}

impl CacheWriteRequest {
    fn payload(self, max_array: usize) -> Result<Map<String, Value>, ApiError> {
        let fields = [
            ("coreThesis", self.core_thesis),
            ("chunks", self.chunks),
            ("model", self.model),
            ("summary", self.summary),
            ("title", self.title),
        ];

        let mut payload = Map::new();
        for (name, value) in fields {
            let Some(value) = value else { continue };
            if let Value::Array(items) = &value {
                if items.len() > max_array {
                    return Err(ApiError::BadRequest(format!(
                        "{} exceeds {} elements",
                        name, max_array
                    )));
                }
            }
            payload.insert(name.to_string(), value);
        }
        Ok(payload)
    }
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.started.elapsed().as_secs();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: uptime,
        uptime,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /api/cache/:hash
pub async fn get_cache(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.analysis.cache().get(&hash).await {
        Some(entry) => Ok(Json(entry.to_flat_json())),
        None => Err(ApiError::NotFound("Cache miss".to_string())),
    }
}

/// POST /api/cache
pub async fn put_cache(
    State(state): State<AppState>,
    Json(body): Json<CacheWriteRequest>,
) -> Result<(StatusCode, Json<CacheWriteResponse>), ApiError> {
    let hash = match (&body.hash, &body.content) {
        (Some(hash), _) if !hash.is_empty() => hash.clone(),
        (_, Some(content)) if !content.is_empty() => state.analysis.hasher().hash(content, None),
        _ => {
            return Err(ApiError::BadRequest(
                "content or hash is required".to_string(),
            ))
        }
    };

    let payload = body.payload(state.max_array_len)?;
    let entry = state
        .analysis
        .cache()
        .put(&hash, Value::Object(payload))
        .await?;

    tracing::info!(hash = short_hash(&hash), "Analysis written to cache");
    Ok((
        StatusCode::CREATED,
        Json(CacheWriteResponse {
            hash,
            cached: true,
            created_at: entry.created_at,
        }),
    ))
}

/// POST /api/content/analyze
pub async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    let response = match state.analysis.submit(request).await? {
        Submission::Cached {
            content_hash,
            result,
        } => (
            StatusCode::OK,
            Json(AnalyzeResponse::cached(content_hash, result)),
        ),
        Submission::Queued { task, .. } => (
            StatusCode::ACCEPTED,
            Json(AnalyzeResponse::queued(task.id, task.content_hash)),
        ),
    };
    Ok(response.into_response())
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    state
        .analysis
        .registry()
        .get_public(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))
}

/// GET /stats/cache
pub async fn cache_stats(State(state): State<AppState>) -> Json<HashMap<String, CacheStatsSnapshot>> {
    Json(state.caches.snapshot())
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ApiError::NotFound("Metrics disabled".to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> CacheWriteRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_payload_keeps_known_fields() {
        let payload = request(json!({
            "hash": "abc",
            "coreThesis": "t",
            "chunks": [{"title": "c1"}],
            "extra": "dropped"
        }))
        .payload(500)
        .unwrap();

        assert_eq!(payload.len(), 2);
        assert_eq!(payload["coreThesis"], "t");
        assert!(payload.get("extra").is_none());
        assert!(payload.get("hash").is_none());
    }

    #[test]
    fn test_payload_caps_arrays() {
        let err = request(json!({"hash": "abc", "chunks": [1, 2, 3]}))
            .payload(2)
            .unwrap_err();
        assert_eq!(err.to_string(), "chunks exceeds 2 elements");
    }
}
