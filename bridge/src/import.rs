//! Client-side import of a document's analysis.
//!
//! Lookup order: local `analysis` cache, bridge cache, then a fresh
//! analysis task on the bridge, polled to completion and written back to
//! the local cache. Every import runs under its own [`Generation`]; starting
//! a new import cancels the previous one, and a superseded import never
//! reaches the [`ViewSink`].

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::types::SubmitRequest;
use crate::cache::CacheStore;
use crate::client::{AnalysisBackend, BridgeError};
use crate::generation::{Generation, GenerationGuard, Outcome};
use crate::hash::{short_hash, ContentHasher};
use crate::poll::{PollError, PollOptions, PollingClient};
use crate::task::TaskView;

/// Where an imported analysis came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSource {
    LocalCache,
    BridgeCache,
    Analyzed,
}

impl ImportSource {
    pub fn from_cache(self) -> bool {
        !matches!(self, ImportSource::Analyzed)
    }
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub content: String,
    pub title: Option<String>,
    pub source: Option<String>,
    /// Skip both cache lookups
    pub use_cache: bool,
}

impl ImportRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            title: None,
            source: None,
            use_cache: true,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// An analysis ready to be shown.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedDocument {
    pub hash: String,
    pub title: String,
    pub analysis: Value,
    pub source: ImportSource,
}

/// Receives the results of imports that are still current.
pub trait ViewSink: Send + Sync {
    fn publish(&self, document: &ImportedDocument);

    /// Task status while the bridge is analysing.
    fn progress(&self, _task: &TaskView) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Imported { hash: String, source: ImportSource },
    /// Finished after a newer import started; nothing was published
    Superseded,
    /// Aborted by [`ImportFlow::cancel`] or by a newer import
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Analysis submission failed: {0}")]
    Submit(#[from] BridgeError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("Bridge accepted the document without a task id")]
    MissingTask,

    #[error("No chunks to import")]
    NoChunks,
}

fn has_chunks(analysis: &Value) -> bool {
    analysis
        .get("chunks")
        .and_then(Value::as_array)
        .is_some_and(|chunks| !chunks.is_empty())
}

fn stopped<T>(outcome: Outcome<T>) -> Result<T, ImportOutcome> {
    match outcome {
        Outcome::Completed(value) => Ok(value),
        Outcome::Stale => Err(ImportOutcome::Superseded),
        Outcome::Cancelled => Err(ImportOutcome::Cancelled),
    }
}

pub struct ImportFlow {
    backend: Arc<dyn AnalysisBackend>,
    poller: PollingClient,
    local: Arc<dyn CacheStore>,
    sink: Arc<dyn ViewSink>,
    hasher: ContentHasher,
    guard: GenerationGuard,
    poll_options: PollOptions,
}

impl ImportFlow {
    pub fn new<B>(backend: Arc<B>, local: Arc<dyn CacheStore>, sink: Arc<dyn ViewSink>) -> Self
    where
        B: AnalysisBackend + 'static,
    {
        let poller = PollingClient::new(backend.clone());
        Self {
            backend,
            poller,
            local,
            sink,
            hasher: ContentHasher::default(),
            guard: GenerationGuard::new(),
            poll_options: PollOptions::default(),
        }
    }

    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }

    pub fn guard(&self) -> &GenerationGuard {
        &self.guard
    }

    /// Abandon the running import, if any.
    pub fn cancel(&self) {
        self.guard.abandon();
    }

    pub async fn run(&self, request: ImportRequest) -> Result<ImportOutcome, ImportError> {
        let generation = self.guard.begin();
        match self.import(&generation, request).await {
            Ok(outcome) => Ok(outcome),
            Err(Interrupted::Stopped(outcome)) => {
                debug!(generation = generation.id(), ?outcome, "Import stopped");
                Ok(outcome)
            }
            Err(Interrupted::Failed(e)) if !generation.is_current() => {
                debug!(generation = generation.id(), error = %e, "Ignoring failure of stale import");
                Ok(ImportOutcome::Superseded)
            }
            Err(Interrupted::Failed(e)) => Err(e),
        }
    }

    async fn import(
        &self,
        generation: &Generation,
        request: ImportRequest,
    ) -> Result<ImportOutcome, Interrupted> {
        let content = request.content.trim();
        let hash = self.hasher.hash(content, None);
        let title = request.title.clone();

        if request.use_cache {
            let local = stopped(generation.run(self.local.get(&hash)).await)?;
            if let Some(entry) = local.filter(|e| has_chunks(&e.payload)) {
                info!(hash = short_hash(&hash), "Local analysis cache hit");
                return self.publish(generation, hash, title, entry.payload, ImportSource::LocalCache);
            }

            let remote = stopped(generation.run(self.backend.cached_analysis(&hash)).await)?;
            if let Some(analysis) = remote.filter(has_chunks) {
                info!(hash = short_hash(&hash), "Bridge cache hit");
                self.write_back(&hash, &analysis).await;
                return self.publish(generation, hash, title, analysis, ImportSource::BridgeCache);
            }
        }

        let submit = SubmitRequest {
            content: content.to_string(),
            title: request.title,
            cache_only: false,
            source: request.source,
        };
        let response = stopped(generation.run(self.backend.submit_analysis(&submit)).await)?
            .map_err(ImportError::from)?;

        let (analysis, source) = match (response.cache_hit, response.result) {
            (true, Some(result)) => (result, ImportSource::BridgeCache),
            _ => {
                let task_id = response.task_id.ok_or(ImportError::MissingTask)?;
                info!(task_id = %task_id, hash = short_hash(&hash), "Waiting for bridge analysis");
                let view = self.wait_for(generation, &task_id).await?;
                (view.result.unwrap_or(Value::Null), ImportSource::Analyzed)
            }
        };

        if !has_chunks(&analysis) {
            return Err(ImportError::NoChunks.into());
        }
        self.write_back(&hash, &analysis).await;
        self.publish(generation, hash, title, analysis, source)
    }

    async fn wait_for(&self, generation: &Generation, task_id: &str) -> Result<TaskView, Interrupted> {
        let sink = &self.sink;
        let polled = self
            .poller
            .poll_with_cancel(
                task_id,
                &self.poll_options,
                |view| {
                    if generation.is_current() {
                        sink.progress(view);
                    }
                },
                generation.token(),
            )
            .await;

        match polled {
            Ok(view) => Ok(view),
            Err(PollError::Cancelled { .. }) => Err(Interrupted::Stopped(ImportOutcome::Cancelled)),
            Err(e) => Err(ImportError::from(e).into()),
        }
    }

    async fn write_back(&self, hash: &str, analysis: &Value) {
        if let Err(e) = self.local.put(hash, analysis.clone()).await {
            warn!(hash = short_hash(hash), error = %e, "Failed to store analysis locally");
        }
    }

    fn publish(
        &self,
        generation: &Generation,
        hash: String,
        title: Option<String>,
        analysis: Value,
        source: ImportSource,
    ) -> Result<ImportOutcome, Interrupted> {
        let title = title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| analysis.get("title").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| "Untitled".to_string());

        let document = ImportedDocument {
            hash: hash.clone(),
            title,
            analysis,
            source,
        };
        match generation.apply(|| self.sink.publish(&document)) {
            Some(()) => Ok(ImportOutcome::Imported { hash, source }),
            None => Err(Interrupted::Stopped(ImportOutcome::Superseded)),
        }
    }
}

/// Why an import did not publish.
enum Interrupted {
    Stopped(ImportOutcome),
    Failed(ImportError),
}

impl From<ImportOutcome> for Interrupted {
    fn from(outcome: ImportOutcome) -> Self {
        Interrupted::Stopped(outcome)
    }
}

impl From<ImportError> for Interrupted {
    fn from(err: ImportError) -> Self {
        Interrupted::Failed(err)
    }
}
