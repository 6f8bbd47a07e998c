//! Background speech warm-up queue.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::speech::SpeechService;

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_MAX_PER_BATCH: usize = 12;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Words waiting or being fetched
    queued: HashSet<String>,
    in_flight: usize,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight == 0
    }
}

/// Fetches word audio ahead of time, at most `concurrency` words at once.
///
/// Failures are logged and dropped.
pub struct SpeechWarmup {
    speech: Arc<SpeechService>,
    state: Mutex<QueueState>,
    idle: Notify,
    cancel: CancellationToken,
    concurrency: usize,
    max_per_batch: usize,
}

impl SpeechWarmup {
    pub fn new(speech: Arc<SpeechService>) -> Arc<Self> {
        Self::with_limits(speech, DEFAULT_CONCURRENCY, DEFAULT_MAX_PER_BATCH)
    }

    pub fn with_limits(
        speech: Arc<SpeechService>,
        concurrency: usize,
        max_per_batch: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            speech,
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
            cancel: CancellationToken::new(),
            concurrency: concurrency.max(1),
            max_per_batch,
        })
    }

    /// Queue up to `max_per_batch` unique words that are neither queued nor
    /// cached yet. Returns how many were added.
    pub async fn enqueue<I, S>(self: &Arc<Self>, words: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let batch: Vec<String> = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty() && seen.insert(w.clone()))
            .take(self.max_per_batch)
            .collect();

        let mut fresh = Vec::with_capacity(batch.len());
        for word in batch {
            if !self.speech.is_word_cached(&word).await {
                fresh.push(word);
            }
        }

        let added = {
            let mut state = self.state.lock();
            let mut added = 0;
            for word in fresh {
                if state.queued.insert(word.clone()) {
                    state.queue.push_back(word);
                    added += 1;
                }
            }
            added
        };

        if added > 0 {
            debug!(added, "Speech warm-up queued");
            self.drain();
        }
        added
    }

    fn drain(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while state.in_flight < self.concurrency {
            let Some(word) = state.queue.pop_front() else {
                break;
            };
            state.in_flight += 1;

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.speech.prefetch_word(&word, Some(&this.cancel)).await {
                    if !e.is_cancelled() {
                        warn!(word = %word, error = %e, "Speech warm-up failed");
                    }
                }
                this.finish(&word);
            });
        }
    }

    fn finish(self: &Arc<Self>, word: &str) {
        let idle = {
            let mut state = self.state.lock();
            state.in_flight -= 1;
            state.queued.remove(word);
            state.is_idle()
        };
        if idle {
            self.idle.notify_waiters();
        } else {
            self.drain();
        }
    }

    /// Drop words that have not started yet. Returns how many were dropped.
    pub fn cancel_pending(&self) -> usize {
        let (dropped, idle) = {
            let mut state = self.state.lock();
            let dropped: Vec<String> = state.queue.drain(..).collect();
            for word in &dropped {
                state.queued.remove(word);
            }
            (dropped.len(), state.is_idle())
        };
        if idle {
            self.idle.notify_waiters();
        }
        dropped
    }

    /// Drop pending words and abort the ones being fetched.
    pub fn shutdown(&self) -> usize {
        self.cancel.cancel();
        self.cancel_pending()
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + state.in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Wait until the queue is empty and nothing is being fetched.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}
