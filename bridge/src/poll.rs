//! Polling client
//!
//! Waits for a remote task to reach a terminal state. Two budgets apply:
//! the overall wall-clock `timeout`, and a bounded number of consecutive
//! query failures. A task that is legitimately still running keeps being
//! polled through flaky connectivity until one of them runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::task::{TaskStatus, TaskView};

/// A query-level failure (network, timeout, unexpected status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    pub message: String,
    /// Whether another attempt could succeed
    pub retryable: bool,
}

impl QueryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Where task status comes from.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch_task(&self, task_id: &str) -> Result<TaskView, QueryError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollError {
    /// The task itself failed; carries its error message verbatim
    #[error("{message}")]
    TaskFailed { task_id: String, message: String },

    /// The source answered with a non-retryable failure (e.g. unknown task)
    #[error("Task {task_id} polling failed: {message}")]
    Rejected { task_id: String, message: String },

    #[error("Task {task_id} polling failed after {attempts} network attempts: {last_error}")]
    RetriesExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Task {task_id} polling timed out after {timeout_ms}ms")]
    TimedOut { task_id: String, timeout_ms: u64 },

    #[error("Task {task_id} polling cancelled")]
    Cancelled { task_id: String },
}

impl PollError {
    /// Whether this is the wall-clock or retry budget running out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PollError::TimedOut { .. } | PollError::RetriesExhausted { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Upper bound for a single backoff sleep
    pub max_backoff: Duration,
    /// Consecutive query failures tolerated; derived from `timeout / interval`
    /// plus slack when unset
    pub max_retries: Option<u32>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(60),
            max_backoff: Duration::from_secs(15),
            max_retries: None,
        }
    }
}

impl PollOptions {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ..Default::default()
        }
    }

    fn retry_budget(&self) -> u32 {
        self.max_retries.unwrap_or_else(|| {
            let interval_ms = self.interval.as_millis().max(1);
            let steps = self.timeout.as_millis().div_ceil(interval_ms);
            u32::try_from(steps).unwrap_or(u32::MAX).saturating_add(5)
        })
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.interval
            .checked_mul(retry)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

pub struct PollingClient {
    source: Arc<dyn TaskSource>,
}

impl PollingClient {
    pub fn new(source: Arc<dyn TaskSource>) -> Self {
        Self { source }
    }

    /// Poll until `done` (returned) or `error` (raised), or a budget runs out.
    pub async fn poll_until_terminal(
        &self,
        task_id: &str,
        options: &PollOptions,
        on_progress: impl FnMut(&TaskView) + Send,
    ) -> Result<TaskView, PollError> {
        self.poll_with_cancel(task_id, options, on_progress, &CancellationToken::new())
            .await
    }

    /// Like [`poll_until_terminal`](Self::poll_until_terminal), aborting promptly when `cancel` fires.
    pub async fn poll_with_cancel(
        &self,
        task_id: &str,
        options: &PollOptions,
        mut on_progress: impl FnMut(&TaskView) + Send,
        cancel: &CancellationToken,
    ) -> Result<TaskView, PollError> {
        let deadline = Instant::now() + options.timeout;
        let max_retries = options.retry_budget();
        let mut retries: u32 = 0;

        let timed_out = || PollError::TimedOut {
            task_id: task_id.to_string(),
            timeout_ms: options.timeout.as_millis() as u64,
        };
        let cancelled = || PollError::Cancelled {
            task_id: task_id.to_string(),
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            let remaining = deadline - now;

            let query = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                query = tokio::time::timeout(remaining, self.source.fetch_task(task_id)) => query,
            };

            let pause = match query {
                Err(_) => return Err(timed_out()),
                Ok(Ok(view)) => match view.status {
                    TaskStatus::Done => return Ok(view),
                    TaskStatus::Error => {
                        return Err(PollError::TaskFailed {
                            task_id: task_id.to_string(),
                            message: view
                                .error
                                .clone()
                                .unwrap_or_else(|| "Task failed".to_string()),
                        })
                    }
                    TaskStatus::Queued | TaskStatus::Processing => {
                        debug!(task_id, status = %view.status, "Task still running");
                        on_progress(&view);
                        retries = 0;
                        options.interval
                    }
                },
                Ok(Err(e)) if !e.retryable => {
                    return Err(PollError::Rejected {
                        task_id: task_id.to_string(),
                        message: e.message,
                    })
                }
                Ok(Err(e)) => {
                    retries += 1;
                    if retries > max_retries {
                        return Err(PollError::RetriesExhausted {
                            task_id: task_id.to_string(),
                            attempts: retries,
                            last_error: e.message,
                        });
                    }
                    let backoff = options.backoff(retries);
                    warn!(
                        task_id,
                        attempt = retries,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Task status query failed, backing off"
                    );
                    backoff
                }
            };

            // Never sleep past the deadline.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let pause = pause.min(remaining);
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOptions;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn view(status: TaskStatus) -> TaskView {
        TaskView {
            id: "t1".into(),
            content_hash: "h".into(),
            status,
            options: TaskOptions::default(),
            result: None,
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Replays scripted responses, repeating the last one forever.
    struct Scripted {
        responses: Mutex<VecDeque<Result<TaskView, QueryError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(responses: Vec<Result<TaskView, QueryError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskSource for Scripted {
        async fn fetch_task(&self, _task_id: &str) -> Result<TaskView, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap()
            }
        }
    }

    fn options(interval_s: u64, timeout_s: u64) -> PollOptions {
        PollOptions::new(
            Duration::from_secs(interval_s),
            Duration::from_secs(timeout_s),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_when_done() {
        let source = Scripted::new(vec![
            Ok(view(TaskStatus::Queued)),
            Ok(view(TaskStatus::Processing)),
            Ok(view(TaskStatus::Done)),
        ]);
        let client = PollingClient::new(source.clone());

        let mut progress = Vec::new();
        let done = client
            .poll_until_terminal("t1", &options(1, 60), |v| progress.push(v.status))
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(progress, vec![TaskStatus::Queued, TaskStatus::Processing]);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_error_is_raised_verbatim_without_retry() {
        let mut failed = view(TaskStatus::Error);
        failed.error = Some("Failed to parse chunking response".into());
        let source = Scripted::new(vec![Ok(failed)]);
        let client = PollingClient::new(source.clone());

        let err = client
            .poll_until_terminal("t1", &options(1, 60), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to parse chunking response");
        assert!(!err.is_timeout());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_processing_times_out() {
        let source = Scripted::new(vec![Ok(view(TaskStatus::Processing))]);
        let client = PollingClient::new(source);

        let start = Instant::now();
        let err = client
            .poll_until_terminal("t1", &options(1, 5), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::TimedOut { .. }));
        assert_eq!(err.to_string(), "Task t1 polling timed out after 5000ms");
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failures_back_off_then_recover() {
        let source = Scripted::new(vec![
            Err(QueryError::transient("connection refused")),
            Err(QueryError::transient("connection refused")),
            Ok(view(TaskStatus::Done)),
        ]);
        let client = PollingClient::new(source.clone());

        let start = Instant::now();
        let done = client
            .poll_until_terminal("t1", &options(1, 60), |_| {})
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        // 1s after the first failure, 2s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_retry_counter() {
        let source = Scripted::new(vec![
            Err(QueryError::transient("reset")),
            Err(QueryError::transient("reset")),
            Ok(view(TaskStatus::Processing)),
            Err(QueryError::transient("reset")),
            Err(QueryError::transient("reset")),
            Ok(view(TaskStatus::Done)),
        ]);
        let client = PollingClient::new(source);
        let opts = PollOptions {
            max_retries: Some(2),
            ..options(1, 60)
        };

        let done = client.poll_until_terminal("t1", &opts, |_| {}).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let source = Scripted::new(vec![Err(QueryError::transient("dns failure"))]);
        let client = PollingClient::new(source.clone());
        let opts = PollOptions {
            max_retries: Some(2),
            ..options(1, 600)
        };

        let err = client.poll_until_terminal("t1", &opts, |_| {}).await.unwrap_err();
        assert!(matches!(err, PollError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(
            err.to_string(),
            "Task t1 polling failed after 3 network attempts: dns failure"
        );
        assert!(err.is_timeout());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_clamped_to_remaining_budget() {
        let source = Scripted::new(vec![Err(QueryError::transient("down"))]);
        let client = PollingClient::new(source);

        let start = Instant::now();
        let err = client
            .poll_until_terminal("t1", &options(10, 15), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::TimedOut { .. }));
        // 10s backoff, then 15s backoff clamped to the 5s left
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_query_error() {
        let source = Scripted::new(vec![Err(QueryError::permanent("Task not found"))]);
        let client = PollingClient::new(source.clone());

        let err = client
            .poll_until_terminal("t1", &options(1, 60), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Rejected { .. }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let source = Scripted::new(vec![Ok(view(TaskStatus::Processing))]);
        let client = PollingClient::new(source);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let err = client
            .poll_with_cancel("t1", &options(1, 60), |_| {}, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Cancelled { .. }));
    }

    #[test]
    fn test_retry_budget_derivation() {
        assert_eq!(options(2, 120).retry_budget(), 65);
        assert_eq!(options(3, 10).retry_budget(), 9);
        let opts = options(3, 60);
        assert_eq!(opts.backoff(1), Duration::from_secs(3));
        assert_eq!(opts.backoff(10), Duration::from_secs(15));
    }
}
