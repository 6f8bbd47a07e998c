//! Task registry
//!
//! In-memory record of analysis tasks and their lifecycle:
//!
//! ```text
//! queued ──▶ processing ──▶ done
//!                      └──▶ error
//! ```
//!
//! Transitions only move forward. Each task is written by the single chain
//! that created it; the registry lock only protects the map itself.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::hash::short_hash;
use crate::{Error, Result};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Done,
    Error,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Done | TaskStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    /// Whether a task may move from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission options carried alongside a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub cache_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A tracked unit of asynchronous work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub content_hash: String,
    pub status: TaskStatus,
    /// Raw submitted input. Never exposed through [`TaskView`].
    pub payload: String,
    pub options: TaskOptions,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            content_hash: self.content_hash.clone(),
            status: self.status,
            options: self.options.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Public view of a task: every field except the raw input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(rename = "taskId")]
    pub id: String,
    pub content_hash: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub options: TaskOptions,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Age limits for [`TaskRegistry::sweep_expired`].
#[derive(Debug, Clone, Copy)]
pub struct TaskRetention {
    /// Terminal tasks older than this (since last update) are dropped
    pub terminal: Duration,
    /// Non-terminal tasks idle for longer than this are dropped
    pub stuck: Duration,
}

impl Default for TaskRetention {
    fn default() -> Self {
        Self {
            terminal: Duration::from_secs(10 * 60),
            stuck: Duration::from_secs(60 * 60),
        }
    }
}

/// Process-local task registry.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task in `queued`.
    pub fn create(
        &self,
        id: impl Into<String>,
        content_hash: impl Into<String>,
        payload: impl Into<String>,
        options: TaskOptions,
    ) -> TaskView {
        let now = now_ms();
        let task = Task {
            id: id.into(),
            content_hash: content_hash.into(),
            status: TaskStatus::Queued,
            payload: payload.into(),
            options,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let view = task.view();

        debug!(task_id = %task.id, hash = short_hash(&task.content_hash), "Task queued");
        metrics::counter!("bridge_tasks_total", "status" => "queued").increment(1);
        self.tasks.write().insert(task.id.clone(), task);
        view
    }

    /// Full task including payload (for the worker that owns it).
    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    pub fn get_public(&self, id: &str) -> Option<TaskView> {
        self.tasks.read().get(id).map(Task::view)
    }

    pub fn set_processing(&self, id: &str) -> Result<Option<TaskView>> {
        self.transition(id, TaskStatus::Processing, |_| {})
    }

    pub fn set_done(&self, id: &str, result: Value) -> Result<Option<TaskView>> {
        self.transition(id, TaskStatus::Done, |task| {
            task.result = Some(result);
        })
    }

    /// Record a failure. Only the error's message is stored.
    pub fn set_error(&self, id: &str, error: impl fmt::Display) -> Result<Option<TaskView>> {
        let message = error.to_string();
        self.transition(id, TaskStatus::Error, |task| {
            task.error = Some(message);
        })
    }

    fn transition(
        &self,
        id: &str,
        next: TaskStatus,
        apply: impl FnOnce(&mut Task),
    ) -> Result<Option<TaskView>> {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(id) else {
            return Ok(None);
        };

        if !task.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: id.to_string(),
                from: task.status,
                to: next,
            });
        }

        apply(task);
        task.status = next;
        task.updated_at = now_ms().max(task.updated_at);

        debug!(task_id = %id, status = %next, "Task transition");
        metrics::counter!("bridge_tasks_total", "status" => next.as_str()).increment(1);
        Ok(Some(task.view()))
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Drop tasks past their retention window. Returns the number removed.
    pub fn sweep_expired(&self, retention: &TaskRetention) -> usize {
        self.sweep_expired_at(retention, now_ms())
    }

    fn sweep_expired_at(&self, retention: &TaskRetention, now: i64) -> usize {
        let terminal_ms = retention.terminal.as_millis() as i64;
        let stuck_ms = retention.stuck.as_millis() as i64;

        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, task| {
            let idle = now - task.updated_at;
            if task.status.is_terminal() {
                idle <= terminal_ms
            } else {
                idle <= stuck_ms
            }
        });
        let removed = before - tasks.len();
        if removed > 0 {
            info!(removed, remaining = tasks.len(), "Swept expired tasks");
        }
        removed
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
