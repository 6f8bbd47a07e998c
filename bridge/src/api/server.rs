use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::routes;
use crate::analysis::AnalysisService;
use crate::cache::CacheRegistry;
use crate::config::{Config, CorsConfig, RateLimitConfig};
use crate::security::{auth_middleware, rate_limit_middleware, ApiKeyAuth, RateLimiter};
use crate::Result;

/// Largest array accepted in a cache write payload.
pub const MAX_PAYLOAD_ARRAY_LEN: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub analysis: Arc<AnalysisService>,
    pub caches: Arc<CacheRegistry>,
    pub metrics: Option<PrometheusHandle>,
    pub started: Instant,
    pub max_array_len: usize,
}

impl AppState {
    pub fn new(analysis: Arc<AnalysisService>, caches: Arc<CacheRegistry>) -> Self {
        Self {
            analysis,
            caches,
            metrics: None,
            started: Instant::now(),
            max_array_len: MAX_PAYLOAD_ARRAY_LEN,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub struct ApiServer {
    state: AppState,
    auth: Arc<ApiKeyAuth>,
    write_limiter: Arc<RateLimiter>,
    analyze_limiter: Arc<RateLimiter>,
    cors_config: CorsConfig,
    max_body_size: usize,
}

impl ApiServer {
    pub fn new(state: AppState, config: &Config) -> Self {
        let auth = ApiKeyAuth::new(config.security.api_key.clone());
        if !auth.is_enabled() {
            tracing::warn!("No API key configured, /api routes are unauthenticated");
        }

        let (write_limiter, analyze_limiter) = Self::build_limiters(&config.rate_limit);
        Self {
            state,
            auth: Arc::new(auth),
            write_limiter: Arc::new(write_limiter),
            analyze_limiter: Arc::new(analyze_limiter),
            cors_config: config.server.cors.clone(),
            max_body_size: config.server.max_body_size,
        }
    }

    fn build_limiters(config: &RateLimitConfig) -> (RateLimiter, RateLimiter) {
        (
            RateLimiter::new(
                config.write_window(),
                config.write_max,
                "Too many requests, please try again later.",
            ),
            RateLimiter::new(
                config.analyze_window(),
                config.analyze_max,
                "Analysis limit exceeded, please try again later.",
            ),
        )
    }

    fn build_cors_layer(&self) -> CorsLayer {
        if !self.cors_config.enabled {
            return CorsLayer::new();
        }

        let origins: Vec<HeaderValue> = self
            .cors_config
            .origins
            .iter()
            .filter(|o| o.as_str() != "*")
            .filter_map(|o| o.parse().ok())
            .collect();

        let has_wildcard = self.cors_config.origins.iter().any(|o| o == "*");

        let cors = if has_wildcard {
            CorsLayer::new().allow_origin(tower_http::cors::Any)
        } else if origins.is_empty() {
            CorsLayer::new()
        } else {
            CorsLayer::new().allow_origin(origins)
        };

        cors.allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(tower_http::cors::Any)
    }

    pub fn router(&self) -> Router {
        let analyze = Router::new()
            .route("/api/content/analyze", post(routes::analyze))
            .route_layer(from_fn_with_state(
                self.analyze_limiter.clone(),
                rate_limit_middleware,
            ));

        let writes = Router::new()
            .route("/api/cache", post(routes::put_cache))
            .merge(analyze)
            .route_layer(from_fn_with_state(
                self.write_limiter.clone(),
                rate_limit_middleware,
            ));

        let reads = Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/cache/:hash", get(routes::get_cache))
            .route("/api/tasks/:id", get(routes::get_task))
            .route("/stats/cache", get(routes::cache_stats))
            .route("/metrics", get(routes::metrics));

        Router::new()
            .merge(reads)
            .merge(writes)
            .layer(from_fn_with_state(self.auth.clone(), auth_middleware))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(self.build_cors_layer())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn serve(self, addr: &str, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` is cancelled.
    pub async fn serve_listener(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", addr);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| crate::Error::Backend(e.to_string()))?;

        tracing::info!("Server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResult, Analyzer};
    use crate::cache::{collections, CacheStore, SqliteDatabase};
    use crate::task::TaskRegistry;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct NoopAnalyzer;

    #[async_trait]
    impl Analyzer for NoopAnalyzer {
        async fn analyze(&self, _text: &str) -> anyhow::Result<AnalysisResult> {
            anyhow::bail!("not used")
        }

        fn model_label(&self) -> String {
            "test/noop".to_string()
        }
    }

    fn router(config: &Config) -> Router {
        let db = SqliteDatabase::in_memory().unwrap();
        let cache: Arc<dyn CacheStore> = Arc::new(db.collection(collections::ANALYSIS, Some(20)));
        let mut caches = CacheRegistry::new();
        caches.register(cache.clone());
        let analysis = Arc::new(AnalysisService::new(
            Arc::new(NoopAnalyzer),
            cache,
            Arc::new(TaskRegistry::new()),
            1,
        ));
        ApiServer::new(AppState::new(analysis, Arc::new(caches)), config).router()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_skips_auth() {
        let mut config = Config::default();
        config.security.api_key = Some("secret".into());
        let app = router(&config);

        let health = app.clone().oneshot(get("/api/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let task = app.clone().oneshot(get("/api/tasks/t1")).await.unwrap();
        assert_eq!(task.status(), StatusCode::UNAUTHORIZED);

        let authed = Request::builder()
            .uri("/api/tasks/t1")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let task = app.oneshot(authed).await.unwrap();
        assert_eq!(task.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(task).await["error"], "Task not found");
    }

    #[tokio::test]
    async fn test_write_limit_applies_to_cache_writes() {
        let mut config = Config::default();
        config.rate_limit.write_max = 1;
        let app = router(&config);

        let first = app
            .clone()
            .oneshot(post_json("/api/cache", json!({"hash": "abc", "summary": "s"})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .clone()
            .oneshot(post_json("/api/cache", json!({"hash": "abc", "summary": "s"})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            json_body(second).await["error"],
            "Too many requests, please try again later."
        );

        let read = app.oneshot(get("/api/cache/abc")).await.unwrap();
        assert_eq!(read.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_disabled_without_recorder() {
        let app = router(&Config::default());
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
