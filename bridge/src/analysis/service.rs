//! Analysis task orchestration: cache lookup, task creation, bounded workers.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::text::infer_title;
use super::{Analyzer, MAX_CONTENT_LENGTH};
use crate::cache::CacheStore;
use crate::hash::{short_hash, ContentHasher};
use crate::task::{TaskOptions, TaskRegistry, TaskView};
use crate::{Error, Result};

/// Body of `POST /api/content/analyze`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cache_only: bool,
    #[serde(default)]
    pub source: Option<String>,
}

impl AnalyzeRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(Value::String(content.into())),
            ..Default::default()
        }
    }
}

/// What `submit` did with a document.
#[derive(Debug)]
pub enum Submission {
    /// Already analysed; the cached result (with `hash` and `createdAt`)
    Cached { content_hash: String, result: Value },
    /// A task was queued; `handle` resolves once it reaches a terminal state
    Queued {
        task: TaskView,
        handle: JoinHandle<()>,
    },
}

impl Submission {
    pub fn content_hash(&self) -> &str {
        match self {
            Submission::Cached { content_hash, .. } => content_hash,
            Submission::Queued { task, .. } => &task.content_hash,
        }
    }
}

/// Runs analyses as tracked tasks, bounded by a semaphore.
pub struct AnalysisService {
    analyzer: Arc<dyn Analyzer>,
    cache: Arc<dyn CacheStore>,
    registry: Arc<TaskRegistry>,
    hasher: ContentHasher,
    permits: Arc<Semaphore>,
    max_content_length: usize,
}

impl AnalysisService {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        cache: Arc<dyn CacheStore>,
        registry: Arc<TaskRegistry>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            analyzer,
            cache,
            registry,
            hasher: ContentHasher::default(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_content_length: MAX_CONTENT_LENGTH,
        }
    }

    pub fn with_max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = max;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn hasher(&self) -> ContentHasher {
        self.hasher
    }

    fn validate(&self, request: &AnalyzeRequest) -> Result<String> {
        let content = match &request.content {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                return Err(Error::Validation(
                    "content is required and must be a string".to_string(),
                ))
            }
        };
        if content.chars().count() > self.max_content_length {
            return Err(Error::Validation(format!(
                "content exceeds {} characters",
                self.max_content_length
            )));
        }
        Ok(content)
    }

    /// Serve from cache or queue a new analysis task.
    pub async fn submit(&self, request: AnalyzeRequest) -> Result<Submission> {
        let content = self.validate(&request)?;
        let content_hash = self.hasher.hash(&content, None);

        if let Some(entry) = self.cache.get(&content_hash).await {
            info!(hash = short_hash(&content_hash), "Analysis cache hit");
            return Ok(Submission::Cached {
                content_hash,
                result: entry.to_flat_json(),
            });
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let options = TaskOptions {
            title: request.title.clone(),
            cache_only: request.cache_only,
            source: Some(
                request
                    .source
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
        };
        let task = self
            .registry
            .create(&task_id, &content_hash, content, options);

        info!(
            task_id = %task_id,
            hash = short_hash(&content_hash),
            "Analysis task queued"
        );

        let worker = TaskWorker {
            analyzer: self.analyzer.clone(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            permits: self.permits.clone(),
        };
        let handle = tokio::spawn(worker.run(task_id, request.title));

        Ok(Submission::Queued { task, handle })
    }
}

/// Owns every transition of one task after creation.
struct TaskWorker {
    analyzer: Arc<dyn Analyzer>,
    cache: Arc<dyn CacheStore>,
    registry: Arc<TaskRegistry>,
    permits: Arc<Semaphore>,
}

impl TaskWorker {
    async fn run(self, task_id: String, title: Option<String>) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.fail(&task_id, "analysis service is shutting down");
                return;
            }
        };

        let Some(task) = self.registry.get(&task_id) else {
            return;
        };
        if let Err(e) = self.registry.set_processing(&task_id) {
            warn!(task_id = %task_id, error = %e, "Could not mark task processing");
            return;
        }

        let outcome = self.analyzer.analyze(&task.payload).await.and_then(|mut result| {
            result.title = title.unwrap_or_else(|| infer_title(&task.payload));
            Ok(serde_json::to_value(&result)?)
        });

        match outcome {
            Ok(payload) => {
                if let Err(e) = self.cache.put(&task.content_hash, payload.clone()).await {
                    warn!(task_id = %task_id, error = %e, "Failed to cache analysis result");
                }

                let mut done = payload;
                if let Value::Object(map) = &mut done {
                    map.insert("hash".to_string(), Value::String(task.content_hash.clone()));
                }
                let chunks = done["chunks"].as_array().map_or(0, Vec::len);
                if let Err(e) = self.registry.set_done(&task_id, done) {
                    warn!(task_id = %task_id, error = %e, "Could not mark task done");
                    return;
                }
                info!(task_id = %task_id, chunks, "Analysis task done");
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Analysis task failed");
                self.fail(&task_id, e);
            }
        }
    }

    fn fail(&self, task_id: &str, error: impl std::fmt::Display) {
        if let Err(e) = self.registry.set_error(task_id, error) {
            warn!(task_id = %task_id, error = %e, "Could not mark task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResult, Chunk};
    use crate::cache::{FileCache, ManualClock};
    use crate::task::TaskStatus;
    use async_trait::async_trait;
    use bridge_storage::LocalStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeAnalyzer {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    impl FakeAnalyzer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        async fn analyze(&self, text: &str) -> anyhow::Result<AnalysisResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("No sentences found in text");
            }
            Ok(AnalysisResult {
                core_thesis: "thesis".into(),
                summary: String::new(),
                model: "fake/model".into(),
                chunks: vec![Chunk {
                    title: "Complete Text".into(),
                    summary: String::new(),
                    summary_zh: String::new(),
                    start_index: 0,
                    end_index: 0,
                    original_text: text.to_string(),
                    extra: Default::default(),
                }],
                title: String::new(),
            })
        }

        fn model_label(&self) -> String {
            "fake/model".into()
        }
    }

    fn service(dir: &TempDir, analyzer: Arc<FakeAnalyzer>, max_concurrent: usize) -> AnalysisService {
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let cache = Arc::new(
            FileCache::new(storage, "analysis", Some(1000)).with_clock(Arc::new(ManualClock::new(7))),
        );
        AnalysisService::new(analyzer, cache, Arc::new(TaskRegistry::new()), max_concurrent)
    }

    async fn run_to_end(submission: Submission) -> TaskView {
        match submission {
            Submission::Queued { task, handle } => {
                handle.await.unwrap();
                task
            }
            Submission::Cached { .. } => panic!("expected a queued task"),
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let analyzer = FakeAnalyzer::new(false);
        let service = service(&dir, analyzer.clone(), 2);

        let first = service
            .submit(AnalyzeRequest::text("Hello world.\nMore text."))
            .await
            .unwrap();
        let hash = first.content_hash().to_string();
        let task = run_to_end(first).await;
        assert_eq!(task.status, TaskStatus::Queued);

        let done = service.registry().get_public(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        let result = done.result.unwrap();
        assert_eq!(result["hash"], hash.as_str());
        assert_eq!(result["title"], "Hello world.");

        match service
            .submit(AnalyzeRequest::text("Hello world.\nMore text."))
            .await
            .unwrap()
        {
            Submission::Cached {
                content_hash,
                result,
            } => {
                assert_eq!(content_hash, hash);
                assert_eq!(result["coreThesis"], "thesis");
                assert_eq!(result["hash"], hash.as_str());
                assert_eq!(result["createdAt"], 7);
            }
            other => panic!("expected cache hit, got {:?}", other),
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_records_message() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, FakeAnalyzer::new(true), 2);

        let task = run_to_end(service.submit(AnalyzeRequest::text("x")).await.unwrap()).await;
        let view = service.registry().get_public(&task.id).unwrap();
        assert_eq!(view.status, TaskStatus::Error);
        assert_eq!(view.error.as_deref(), Some("No sentences found in text"));
        assert!(service.cache().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_explicit_title_and_options() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, FakeAnalyzer::new(false), 2);

        let request = AnalyzeRequest {
            title: Some("My Doc".into()),
            cache_only: true,
            ..AnalyzeRequest::text("Body.")
        };
        let task = run_to_end(service.submit(request).await.unwrap()).await;
        assert!(task.options.cache_only);
        assert_eq!(task.options.source.as_deref(), Some("unknown"));

        let view = service.registry().get_public(&task.id).unwrap();
        assert_eq!(view.result.unwrap()["title"], "My Doc");
    }

    #[tokio::test]
    async fn test_validation() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, FakeAnalyzer::new(false), 2).with_max_content_length(10);

        let empty = service.submit(AnalyzeRequest::text("")).await.unwrap_err();
        assert!(matches!(empty, Error::Validation(_)));

        let not_string = AnalyzeRequest {
            content: Some(serde_json::json!(42)),
            ..Default::default()
        };
        assert!(service.submit(not_string).await.is_err());

        let too_long = service
            .submit(AnalyzeRequest::text("x".repeat(11)))
            .await
            .unwrap_err();
        assert_eq!(
            too_long.to_string(),
            "Validation error: content exceeds 10 characters"
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = TempDir::new().unwrap();
        let analyzer = FakeAnalyzer::new(false);
        let service = service(&dir, analyzer.clone(), 2);

        let mut handles = Vec::new();
        for i in 0..6 {
            if let Submission::Queued { handle, .. } = service
                .submit(AnalyzeRequest::text(format!("Document {}.", i)))
                .await
                .unwrap()
            {
                handles.push(handle);
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 6);
        assert!(analyzer.peak.load(Ordering::SeqCst) <= 2);
    }
}
