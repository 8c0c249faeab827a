//! Worker metrics
//!
//! The worker owns one [`SharedMetrics`] and updates it as tasks start, make
//! progress and finish. The encoder gauges come from the progress snapshots
//! the chunk executor already reads, so the exporter never touches ffmpeg.

use crate::progress::ProgressSnapshot;
use crate::queue::Delivery;
use crate::task::TaskId;
use crate::worker::Disposition;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Numeric view of the encoder's progress keys. A value ffmpeg reports as
/// `N/A` stays `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncoderGauges {
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
    pub quality: Option<f64>,
}

impl EncoderGauges {
    pub fn from_progress(snapshot: &ProgressSnapshot) -> Self {
        Self {
            fps: gauge(&snapshot.fps, ""),
            bitrate_kbps: gauge(&snapshot.bitrate, "kbits/s"),
            speed: gauge(&snapshot.speed, "x"),
            quality: gauge(&snapshot.quality, ""),
        }
    }
}

fn gauge(value: &str, unit: &str) -> Option<f64> {
    let value = value.trim();
    value.strip_suffix(unit).unwrap_or(value).trim().parse().ok()
}

/// A task this worker is running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetrics {
    pub id: String,
    pub input_path: String,
    pub attempt: u32,
    pub started_unix_ms: i64,
    /// Last heartbeat detail
    pub progress: String,
    pub encoder: EncoderGauges,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub tasks: Vec<TaskMetrics>,
    pub running_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Most recent encoder report across all tasks
    pub encoder: EncoderGauges,
}

/// Metrics shared between the worker and the exporter
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

impl MetricsSnapshot {
    pub fn task_started(&mut self, delivery: &Delivery) {
        let now = current_timestamp_ms();
        self.tasks.retain(|t| t.id != delivery.id.as_str());
        self.tasks.push(TaskMetrics {
            id: delivery.id.to_string(),
            input_path: delivery.task.input.display().to_string(),
            attempt: delivery.attempt,
            started_unix_ms: now,
            progress: String::new(),
            encoder: EncoderGauges::default(),
        });
        self.running_tasks = self.tasks.len();
        self.timestamp_unix_ms = now;
    }

    pub fn task_detail(&mut self, id: &TaskId, detail: &str) {
        if let Some(task) = self.task_mut(id) {
            task.progress = detail.to_string();
        }
        self.timestamp_unix_ms = current_timestamp_ms();
    }

    pub fn task_gauges(&mut self, id: &TaskId, gauges: EncoderGauges) {
        if let Some(task) = self.task_mut(id) {
            task.encoder = gauges.clone();
        }
        self.encoder = gauges;
        self.timestamp_unix_ms = current_timestamp_ms();
    }

    /// Drop the task from the running set. `None` means the result could not
    /// be recorded in the queue, which counts as a failure.
    pub fn task_finished(&mut self, id: &TaskId, disposition: Option<Disposition>) {
        self.tasks.retain(|t| t.id != id.as_str());
        self.running_tasks = self.tasks.len();
        match disposition {
            Some(Disposition::Completed) => self.completed_tasks += 1,
            Some(Disposition::Failed { .. }) | None => self.failed_tasks += 1,
            Some(Disposition::Stale) => {}
        }
        self.timestamp_unix_ms = current_timestamp_ms();
    }

    fn task_mut(&mut self, id: &TaskId) -> Option<&mut TaskMetrics> {
        self.tasks.iter_mut().find(|t| t.id == id.as_str())
    }
}

fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
