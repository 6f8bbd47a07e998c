//! Cache-first, single-flight request coalescing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PrefetchError;
use crate::cache::CacheStore;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, PrefetchError>>>;

struct InFlight {
    id: u64,
    future: SharedFetch,
    cancel: CancellationToken,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

/// Serves artifacts from a [`CacheStore`], running at most one fetch per key.
///
/// Concurrent callers for a key that is already being fetched await the same
/// shared result. Completed fetches are written to the cache before they
/// leave the in-flight map, so a later caller always finds one or the other.
pub struct Coalescer {
    cache: Arc<dyn CacheStore>,
    in_flight: InFlightMap,
    next_id: AtomicU64,
}

impl Coalescer {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Cached value for `key`, without starting any work.
    pub async fn cached(&self, key: &str) -> Option<Value> {
        self.cache.get(key).await.map(|entry| entry.payload)
    }

    /// Return the cached value for `key`, join an in-flight fetch, or start one.
    ///
    /// The fetch is aborted when `caller` (if the fetch was started by this
    /// call) or [`cancel`](Self::cancel) fires. A caller that merely joined an
    /// existing fetch stops waiting when its own token fires but leaves the
    /// shared fetch running.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        caller: Option<&CancellationToken>,
        fetch: F,
    ) -> Result<Value, PrefetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if let Some(value) = self.cached(key).await {
            debug!(collection = self.cache.collection(), key, "Prefetch cache hit");
            return Ok(value);
        }

        let shared = {
            let mut map = self.in_flight.lock();
            match map.get(key) {
                Some(existing) => {
                    debug!(collection = self.cache.collection(), key, "Joining in-flight fetch");
                    metrics::counter!("bridge_prefetch_coalesced_total", "collection" => self.cache.collection().to_string())
                        .increment(1);
                    existing.future.clone()
                }
                None => {
                    let token = match caller {
                        Some(parent) => parent.child_token(),
                        None => CancellationToken::new(),
                    };
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = self.spawn_fetch(key, id, token.clone(), fetch());
                    map.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            future: future.clone(),
                            cancel: token,
                        },
                    );
                    future
                }
            }
        };

        match caller {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(PrefetchError::Cancelled),
                result = shared => result,
            },
            None => shared.await,
        }
    }

    fn spawn_fetch<Fut>(&self, key: &str, id: u64, token: CancellationToken, work: Fut) -> SharedFetch
    where
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let in_flight = self.in_flight.clone();
        let key = key.to_string();

        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(PrefetchError::Cancelled),
                outcome = work => outcome.map_err(|e| PrefetchError::Failed(e.to_string())),
            };

            if let Ok(value) = &result {
                if let Err(e) = cache.put(&key, value.clone()).await {
                    warn!(collection = cache.collection(), key = %key, error = %e, "Failed to cache prefetched artifact");
                }
            }

            let mut map = in_flight.lock();
            if map.get(&key).is_some_and(|entry| entry.id == id) {
                map.remove(&key);
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(PrefetchError::Cancelled),
                Err(e) => Err(PrefetchError::Failed(format!("fetch task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }

    /// Abort the in-flight fetch for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        match self.in_flight.lock().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(collection = self.cache.collection(), key, "Cancelled in-flight fetch");
                true
            }
            None => false,
        }
    }

    /// Abort every in-flight fetch.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<InFlight> = self.in_flight.lock().drain().map(|(_, v)| v).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}
