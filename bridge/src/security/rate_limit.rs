//! Rolling-window rate limiting keyed by caller identity.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::middleware::bearer_token;
use crate::api::ApiError;

/// Identities tracked before idle ones are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Sliding-window log limiter: at most `max` requests per identity in any
/// `window`.
pub struct RateLimiter {
    window: Duration,
    max: usize,
    message: String,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: usize, message: impl Into<String>) -> Self {
        Self {
            window,
            max,
            message: message.into(),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `identity`, or return how long until it would be allowed.
    pub fn check(&self, identity: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut hits = self.hits.lock();

        if hits.len() > PRUNE_THRESHOLD {
            let window = self.window;
            hits.retain(|_, log| log.back().is_some_and(|last| now.duration_since(*last) < window));
        }

        let log = hits.entry(identity.to_string()).or_default();
        while log.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            log.pop_front();
        }

        if log.len() >= self.max {
            let retry_after = log
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        log.push_back(now);
        Ok(())
    }

    pub fn tracked(&self) -> usize {
        self.hits.lock().len()
    }
}

/// Caller identity: bearer token, then socket address, then the first
/// `X-Forwarded-For` entry, else `unknown`.
pub fn client_identity(request: &Request) -> String {
    if let Some(token) = bearer_token(request) {
        return format!("token:{}", crate::hash::short_hash(&crate::hash::hash_text(token)));
    }
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| format!("ip:{}", ip.trim()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = client_identity(&request);
    match limiter.check(&identity) {
        Ok(()) => Ok(next.run(request).await),
        Err(retry_after) => {
            tracing::warn!(identity = %identity, path = request.uri().path(), "Rate limit exceeded");
            Err(ApiError::RateLimited {
                message: limiter.message.clone(),
                retry_after_secs: retry_after.as_secs_f64().ceil() as u64,
            })
        }
    }
}
