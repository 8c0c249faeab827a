//! Durable task queue
//!
//! The scanner and the `add` command submit tasks; workers dequeue, report
//! liveness and acknowledge them. [`TaskQueue`] is the seam between the two
//! sides; [`FileQueue`] implements it on a shared directory of JSON records.

pub mod file;

pub use file::FileQueue;

use crate::config::QueueConfig;
use crate::task::{TaskId, UpscaleTask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    /// A task with the same identity is already queued or retained
    #[error("Task {0} already exists")]
    Conflict(TaskId),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// The delivery no longer owns the task (removed or redelivered)
    #[error("Delivery of task {0} is no longer current")]
    Stale(TaskId),

    #[error("Queue storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt task record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-task scheduling constraints fixed at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Upper bound for one attempt
    pub timeout_secs: u64,
    /// How long a finished task keeps its identity reserved
    pub retention_secs: u64,
}

impl SubmitOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
            retention_secs: config.retention_days.saturating_mul(24 * 3600),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task: UpscaleTask,
    pub options: SubmitOptions,
    pub status: TaskStatus,
    /// Deliveries so far
    pub attempts: u32,
    /// Unix timestamp (milliseconds) of submission
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last change
    pub updated_at: i64,
    /// Unix timestamp (milliseconds) after which a running task is presumed abandoned
    pub lease_expires_at: Option<i64>,
    /// Token of the current delivery
    pub delivery: Option<Uuid>,
    /// Last heartbeat detail
    pub progress: Option<String>,
    pub last_error: Option<String>,
    /// Unix timestamp (milliseconds) when the task finished
    pub finished_at: Option<i64>,
}

/// A task handed to a worker. Acknowledge with `complete` or `fail`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: TaskId,
    pub task: UpscaleTask,
    /// 1 for the first delivery
    pub attempt: u32,
    pub timeout: Duration,
    pub token: Uuid,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a task. Fails with [`QueueError::Conflict`] if the identity is taken.
    async fn submit(
        &self,
        id: &TaskId,
        task: &UpscaleTask,
        options: &SubmitOptions,
    ) -> Result<(), QueueError>;

    /// Delete a task in any state.
    async fn remove(&self, id: &TaskId) -> Result<(), QueueError>;

    /// Take the next task, highest priority lane first. `None` when idle.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Extend the delivery's lease and record progress.
    async fn heartbeat(&self, delivery: &Delivery, detail: &str) -> Result<(), QueueError>;

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Record a failure; retryable failures are requeued while retries remain.
    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let options = SubmitOptions::from_config(&QueueConfig::default());
        assert_eq!(options.max_retries, 2);
        assert_eq!(options.timeout(), Duration::from_secs(3 * 3600));
        assert_eq!(options.retention(), Duration::from_secs(30 * 24 * 3600));
    }

    #[test]
    fn test_finished_statuses() {
        assert!(!TaskStatus::Pending.is_finished());
        assert!(!TaskStatus::Running.is_finished());
        assert!(TaskStatus::Completed.is_finished());
        assert!(TaskStatus::Failed.is_finished());
    }
}
