//! Task submission with duplicate handling.

use crate::queue::{QueueError, SubmitOptions, TaskQueue};
use crate::task::{TaskId, UpscaleTask};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SubmitError {
    /// The task is already queued, running or retained
    #[error("Task {0} is already queued")]
    Conflict(TaskId),

    /// `force` could not remove the existing task
    #[error("Failed to remove existing task {id}: {source}")]
    Remove {
        id: TaskId,
        #[source]
        source: QueueError,
    },

    #[error(transparent)]
    Queue(QueueError),
}

/// Submits tasks under their output-derived identity.
#[derive(Clone)]
pub struct Submitter {
    queue: Arc<dyn TaskQueue>,
    options: SubmitOptions,
}

impl Submitter {
    pub fn new(queue: Arc<dyn TaskQueue>, options: SubmitOptions) -> Self {
        Self { queue, options }
    }

    /// Enqueue `task`.
    ///
    /// Without `force` a duplicate is reported as [`SubmitError::Conflict`].
    /// With `force` the existing task is removed first and submission is
    /// retried once; a removal failure is returned as-is.
    pub async fn submit(&self, task: &UpscaleTask, force: bool) -> Result<TaskId, SubmitError> {
        let id = task.id();
        match self.queue.submit(&id, task, &self.options).await {
            Ok(()) => {}
            Err(QueueError::Conflict(_)) if force => {
                debug!(id = %id, "replacing existing task");
                match self.queue.remove(&id).await {
                    // Finished and purged in the meantime
                    Ok(()) | Err(QueueError::NotFound(_)) => {}
                    Err(source) => return Err(SubmitError::Remove { id, source }),
                }
                self.queue
                    .submit(&id, task, &self.options)
                    .await
                    .map_err(|e| match e {
                        QueueError::Conflict(id) => SubmitError::Conflict(id),
                        other => SubmitError::Queue(other),
                    })?;
            }
            Err(QueueError::Conflict(id)) => return Err(SubmitError::Conflict(id)),
            Err(e) => return Err(SubmitError::Queue(e)),
        }

        info!(
            id = %id,
            input = %task.input.display(),
            output = %task.output.display(),
            priority = %task.priority,
            "Enqueued task"
        );
        Ok(id)
    }
}
