//! Generation guard
//!
//! A monotonically increasing counter naming the "current" logical
//! operation, paired with a cancellation token for that operation's network
//! calls. Starting a new generation cancels the previous token, and any
//! continuation holding an older [`Generation`] can check whether it is stale
//! before touching shared state.
//!
//! ```
//! use bridge::generation::GenerationGuard;
//!
//! # async fn example() {
//! let guard = GenerationGuard::new();
//! let first = guard.begin();
//! let second = guard.begin();
//!
//! assert!(first.token().is_cancelled());
//! assert!(!first.is_current());
//! assert!(second.is_current());
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Inner {
    current: AtomicU64,
    token: Mutex<CancellationToken>,
}

/// Shared generation counter. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GenerationGuard {
    inner: Arc<Inner>,
}

impl Default for GenerationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationGuard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                current: AtomicU64::new(0),
                token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Start a new generation: cancel the previous token, bump the counter and
    /// hand out a fresh token.
    pub fn begin(&self) -> Generation {
        let mut token = self.inner.token.lock();
        token.cancel();
        let id = self.inner.current.fetch_add(1, Ordering::AcqRel) + 1;
        *token = CancellationToken::new();

        Generation {
            id,
            token: token.clone(),
            guard: self.clone(),
        }
    }

    /// Abandon whatever is running without starting anything new.
    pub fn abandon(&self) {
        let mut token = self.inner.token.lock();
        token.cancel();
        self.inner.current.fetch_add(1, Ordering::AcqRel);
        *token = CancellationToken::new();
    }

    pub fn current(&self) -> u64 {
        self.inner.current.load(Ordering::Acquire)
    }

    pub fn is_current(&self, id: u64) -> bool {
        self.current() == id
    }
}

/// Outcome of running work under a [`Generation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    /// Finished, but a newer generation started meanwhile; the result was dropped
    Stale,
    /// The generation's token fired before the work finished
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// A captured generation value plus its cancellation token.
#[derive(Debug, Clone)]
pub struct Generation {
    id: u64,
    token: CancellationToken,
    guard: GenerationGuard,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Still the latest generation and not cancelled.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled() && self.guard.is_current(self.id)
    }

    /// Run `f` only if this generation is still current.
    pub fn apply<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.is_current() {
            Some(f())
        } else {
            None
        }
    }

    /// Drive `fut` to completion unless the token fires first, then report
    /// whether the result is still wanted.
    pub async fn run<F, T>(&self, fut: F) -> Outcome<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Outcome::Cancelled,
            value = fut => {
                if self.is_current() {
                    Outcome::Completed(value)
                } else {
                    Outcome::Stale
                }
            }
        }
    }
}
