//! Worker runtime
//!
//! Pulls tasks from the queue and runs up to `concurrency` of them at once.
//! Every attempt runs under a child of the worker's shutdown token and is
//! cancelled when its timeout elapses, when the queue reports the delivery as
//! stale, or when the worker shuts down.

use crate::config::Config;
use crate::heartbeat::Heartbeat;
use crate::metrics::{EncoderGauges, SharedMetrics};
use crate::orchestrator::{UpscaleError, Upscaler};
use crate::progress::ProgressSnapshot;
use crate::queue::file::DEFAULT_LEASE;
use crate::queue::{Delivery, QueueError, TaskQueue};
use crate::task::TaskId;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The queue rejected a completion or failure report
    #[error("Failed to acknowledge task {id}: {source}")]
    Ack {
        id: TaskId,
        #[source]
        source: QueueError,
    },
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Reported as failed; the queue requeues retryable failures with retries left
    Failed { retryable: bool },
    /// The queue no longer associates the task with this delivery
    Stale,
}

/// Counts from one worker run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: usize,
    pub failed: usize,
    pub stale: usize,
}

impl WorkerSummary {
    fn record(&mut self, result: Result<Disposition, WorkerError>) {
        match result {
            Ok(Disposition::Completed) => self.completed += 1,
            Ok(Disposition::Failed { .. }) => self.failed += 1,
            Ok(Disposition::Stale) => self.stale += 1,
            Err(e) => {
                error!(error = %e, "Task result was not recorded");
                self.failed += 1;
            }
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    upscaler: Arc<Upscaler>,
    concurrency: usize,
    poll_interval: Duration,
    keepalive: Duration,
    metrics: Option<SharedMetrics>,
}

impl Worker {
    pub fn new(queue: Arc<dyn TaskQueue>, upscaler: Upscaler, config: &Config) -> Self {
        Self {
            queue,
            upscaler: Arc::new(upscaler),
            concurrency: config.worker.concurrency.max(1) as usize,
            poll_interval: Duration::from_secs(config.queue.poll_interval_secs.max(1)),
            keepalive: DEFAULT_LEASE / 3,
            metrics: None,
        }
    }

    /// Publish task counts and encoder gauges into `metrics`.
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delay between polls while the queue is empty.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Interval at which a running task's lease is renewed even without
    /// progress. Must stay well below the queue's lease.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    /// Process tasks until `shutdown` is cancelled.
    ///
    /// Running tasks are cancelled with the shutdown and reported as
    /// retryable failures; the call returns once all of them have finished.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerSummary {
        info!(concurrency = self.concurrency, "Worker started");
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();
        let mut summary = WorkerSummary::default();

        loop {
            while let Some(joined) = running.try_join_next() {
                absorb(&mut summary, joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = match self.queue.dequeue().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    if self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to dequeue task");
                    drop(permit);
                    if self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let worker = self.clone();
            let shutdown = shutdown.clone();
            running.spawn(async move {
                let _permit = permit;
                worker.process(&delivery, &shutdown).await
            });
        }

        if !running.is_empty() {
            info!(running = running.len(), "Worker stopping, waiting for running tasks");
        }
        while let Some(joined) = running.join_next().await {
            absorb(&mut summary, joined);
        }
        info!(
            completed = summary.completed,
            failed = summary.failed,
            stale = summary.stale,
            "Worker stopped"
        );
        summary
    }

    /// Sleep for one poll interval. Returns true if shutdown was requested.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }

    /// Run one delivery to completion and report the result to the queue.
    pub async fn process(
        &self,
        delivery: &Delivery,
        shutdown: &CancellationToken,
    ) -> Result<Disposition, WorkerError> {
        info!(
            id = %delivery.id,
            attempt = delivery.attempt,
            input = %delivery.task.input.display(),
            "Starting task"
        );
        if let Some(metrics) = &self.metrics {
            metrics.write().await.task_started(delivery);
        }
        let cancel = shutdown.child_token();
        let heartbeat = QueueHeartbeat::new(self.queue.as_ref(), delivery, cancel.clone())
            .with_metrics(self.metrics.as_ref());

        let run = self.upscaler.run(&delivery.task, &heartbeat, &cancel);
        tokio::pin!(run);
        let deadline = tokio::time::sleep(delivery.timeout);
        tokio::pin!(deadline);
        let mut keepalive = interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timed_out = false;

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = &mut deadline, if !timed_out => {
                    warn!(
                        id = %delivery.id,
                        timeout = ?delivery.timeout,
                        "Task timed out, cancelling"
                    );
                    timed_out = true;
                    cancel.cancel();
                }
                _ = keepalive.tick() => heartbeat.keepalive().await,
            }
        };

        let ack = match result {
            Ok(outcome) => {
                info!(id = %delivery.id, ?outcome, "Task completed");
                self.queue
                    .complete(delivery)
                    .await
                    .map(|()| Disposition::Completed)
            }
            Err(e) => {
                let (message, retryable) = failure_report(&e, timed_out, delivery, shutdown);
                error!(id = %delivery.id, retryable, error = %message, "Task failed");
                self.queue
                    .fail(delivery, &message, retryable)
                    .await
                    .map(|()| Disposition::Failed { retryable })
            }
        };

        let disposition = match ack {
            Ok(disposition) => Ok(disposition),
            Err(QueueError::Stale(id)) => {
                warn!(id = %id, "Delivery is no longer current, result dropped");
                Ok(Disposition::Stale)
            }
            Err(source) => Err(WorkerError::Ack {
                id: delivery.id.clone(),
                source,
            }),
        };
        if let Some(metrics) = &self.metrics {
            let recorded = disposition.as_ref().ok().copied();
            metrics.write().await.task_finished(&delivery.id, recorded);
        }
        disposition
    }
}

fn absorb(
    summary: &mut WorkerSummary,
    joined: Result<Result<Disposition, WorkerError>, tokio::task::JoinError>,
) {
    match joined {
        Ok(result) => summary.record(result),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            error!(error = %e, "Task runner was aborted");
            summary.failed += 1;
        }
    }
}

/// Message and retry decision for a failed attempt.
fn failure_report(
    error: &UpscaleError,
    timed_out: bool,
    delivery: &Delivery,
    shutdown: &CancellationToken,
) -> (String, bool) {
    match error {
        UpscaleError::Cancelled if timed_out => (
            format!("timed out after {}s", delivery.timeout.as_secs()),
            true,
        ),
        UpscaleError::Cancelled if shutdown.is_cancelled() => {
            ("worker shut down".to_string(), true)
        }
        other => (other.to_string(), other.is_retryable()),
    }
}

/// Relays progress to the queue, renewing the delivery's lease.
struct QueueHeartbeat<'a> {
    queue: &'a dyn TaskQueue,
    delivery: &'a Delivery,
    cancel: CancellationToken,
    last: Mutex<String>,
    metrics: Option<&'a SharedMetrics>,
}

impl<'a> QueueHeartbeat<'a> {
    fn new(queue: &'a dyn TaskQueue, delivery: &'a Delivery, cancel: CancellationToken) -> Self {
        Self {
            queue,
            delivery,
            cancel,
            last: Mutex::new(String::new()),
            metrics: None,
        }
    }

    fn with_metrics(mut self, metrics: Option<&'a SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Renew the lease with the most recent detail.
    async fn keepalive(&self) {
        let detail = self.last.lock().unwrap_or_else(|e| e.into_inner()).clone();
        self.report(&detail).await;
    }

    async fn report(&self, detail: &str) {
        match self.queue.heartbeat(self.delivery, detail).await {
            Ok(()) => debug!(id = %self.delivery.id, detail, "heartbeat"),
            Err(QueueError::Stale(id)) => {
                warn!(id = %id, "Task was taken away from this worker, cancelling");
                self.cancel.cancel();
            }
            Err(e) => warn!(id = %self.delivery.id, error = %e, "Heartbeat failed"),
        }
    }
}

#[async_trait]
impl Heartbeat for QueueHeartbeat<'_> {
    async fn beat(&self, detail: &str) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = detail.to_string();
        if let Some(metrics) = self.metrics {
            metrics.write().await.task_detail(&self.delivery.id, detail);
        }
        self.report(detail).await;
    }

    async fn progress(&self, snapshot: &ProgressSnapshot) {
        if let Some(metrics) = self.metrics {
            let gauges = EncoderGauges::from_progress(snapshot);
            metrics.write().await.task_gauges(&self.delivery.id, gauges);
        }
        self.beat(&snapshot.to_string()).await;
    }
}
