//! Prefetch orchestration
//!
//! Reader-side artifacts are computed speculatively and cached so they are
//! ready before they are needed:
//!
//! - request-scoped: keywords and translations per chunk, thought groups per
//!   sentence. Each goes through a [`Coalescer`] (cache, then in-flight
//!   handle, then a new fetch).
//! - queue-scoped: word audio, fed through [`SpeechWarmup`] with bounded
//!   concurrency.
//!
//! Prefetching is an optimization. Callers that only warm caches should
//! log and drop errors.

mod annotate;
mod coalesce;
mod warmup;

pub use annotate::{attach_sentences, Annotator, Keyword, LlmAnnotator, Slice, ThoughtGroup};
pub use coalesce::Coalescer;
pub use warmup::SpeechWarmup;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::CacheStore;
use crate::hash::ContentHasher;

/// Outcome of a failed or aborted prefetch, shared by every coalesced waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrefetchError {
    #[error("Prefetch cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl PrefetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PrefetchError::Cancelled)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, PrefetchError> {
    serde_json::from_value(value).map_err(|e| PrefetchError::Failed(format!("invalid cached artifact: {}", e)))
}

/// Cache stores backing the prefetcher.
pub struct PrefetchStores {
    pub keywords: Arc<dyn CacheStore>,
    pub translations: Arc<dyn CacheStore>,
    pub thought_groups: Arc<dyn CacheStore>,
}

pub struct Prefetcher {
    annotator: Arc<dyn Annotator>,
    keywords: Coalescer,
    translations: Coalescer,
    thought_groups: Coalescer,
    hasher: ContentHasher,
    warmup: Option<Arc<SpeechWarmup>>,
}

impl Prefetcher {
    pub fn new(annotator: Arc<dyn Annotator>, stores: PrefetchStores) -> Self {
        Self {
            annotator,
            keywords: Coalescer::new(stores.keywords),
            translations: Coalescer::new(stores.translations),
            thought_groups: Coalescer::new(stores.thought_groups),
            hasher: ContentHasher::with_context(),
            warmup: None,
        }
    }

    pub fn with_speech_warmup(mut self, warmup: Arc<SpeechWarmup>) -> Self {
        self.warmup = Some(warmup);
        self
    }

    /// Keywords for a chunk, cached under `chunk_id`.
    pub async fn prefetch_keywords(
        &self,
        chunk_id: &str,
        chunk_text: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Keyword>, PrefetchError> {
        let annotator = self.annotator.clone();
        let text = chunk_text.to_string();
        let value = self
            .keywords
            .get_or_fetch(chunk_id, cancel, move || async move {
                let keywords = annotator.extract_keywords(&text).await?;
                Ok(serde_json::to_value(keywords)?)
            })
            .await?;
        decode(value)
    }

    /// Translations for a chunk's sentences, cached under `chunk_id`.
    pub async fn prefetch_translations(
        &self,
        chunk_id: &str,
        sentences: &[String],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>, PrefetchError> {
        if sentences.is_empty() {
            return Ok(Vec::new());
        }
        let annotator = self.annotator.clone();
        let sentences = sentences.to_vec();
        let value = self
            .translations
            .get_or_fetch(chunk_id, cancel, move || async move {
                let translations = annotator.translate_sentences(&sentences).await?;
                Ok(serde_json::to_value(translations)?)
            })
            .await?;
        decode(value)
    }

    /// Cache key for a sentence's thought groups under the current model.
    pub fn thought_group_key(&self, sentence: &str) -> String {
        self.hasher
            .hash(sentence, Some(&self.annotator.model_label()))
    }

    /// Thought groups for a sentence. An empty split is an error and is not cached.
    pub async fn thought_groups(
        &self,
        sentence: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ThoughtGroup>, PrefetchError> {
        let key = self.thought_group_key(sentence);
        let annotator = self.annotator.clone();
        let sentence = sentence.to_string();
        let value = self
            .thought_groups
            .get_or_fetch(&key, cancel, move || async move {
                let groups = annotator.split_thought_groups(&sentence).await?;
                if groups.is_empty() {
                    anyhow::bail!("Model returned no thought groups");
                }
                Ok(serde_json::to_value(groups)?)
            })
            .await?;
        decode(value)
    }

    /// Queue audio warm-up for a chunk's keywords. Returns how many words were queued.
    pub async fn prefetch_speech(&self, keywords: &[Keyword]) -> usize {
        match &self.warmup {
            Some(warmup) => warmup.enqueue(keywords.iter().map(|k| k.word.as_str())).await,
            None => 0,
        }
    }

    /// Keywords already cached for `chunk_id`, without fetching.
    pub async fn keywords_if_ready(&self, chunk_id: &str) -> Option<Vec<Keyword>> {
        let value = self.keywords.cached(chunk_id).await?;
        decode(value).ok()
    }

    pub fn is_pending(&self, chunk_id: &str) -> bool {
        self.keywords.is_pending(chunk_id) || self.translations.is_pending(chunk_id)
    }

    /// Abort the keyword and translation fetches for one chunk.
    pub fn cancel(&self, chunk_id: &str) -> bool {
        let keywords = self.keywords.cancel(chunk_id);
        let translations = self.translations.cancel(chunk_id);
        keywords || translations
    }

    /// Abort every request-scoped fetch and drop queued audio warm-up.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = self.keywords.cancel_all()
            + self.translations.cancel_all()
            + self.thought_groups.cancel_all();
        if let Some(warmup) = &self.warmup {
            cancelled += warmup.cancel_pending();
        }
        debug!(cancelled, "Cancelled all prefetches");
        cancelled
    }
}
