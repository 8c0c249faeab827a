//! Video Upscaler
//!
//! Resumable, chunked 1080p to 2160p upscaling: directory scanning, a durable
//! task queue, and a worker that pipes a frame generator into an encoder one
//! chunk at a time.

pub mod chunk;
pub mod concurrency;
pub mod encode;
pub mod frame_count;
pub mod heartbeat;
pub mod lines;
pub mod manifest;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod replace;
pub mod scan;
pub mod startup;
pub mod submit;
pub mod task;
pub mod task_log;
pub mod work_dir;
pub mod worker;

pub use video_upscaler_config as config;
pub use video_upscaler_config::Config;
pub use chunk::{plan_chunks, Chunk};
pub use encode::{ChunkError, ChunkExecutor, ChunkJob, ProcessError};
pub use frame_count::{count_frames, ProbeError};
pub use heartbeat::{Heartbeat, LogHeartbeat};
pub use metrics::{new_shared_metrics, EncoderGauges, MetricsSnapshot, SharedMetrics};
pub use metrics_server::{run_metrics_server, ServerError};
pub use orchestrator::{UpscaleError, UpscaleOutcome, Upscaler};
pub use queue::{
    Delivery, FileQueue, QueueError, SubmitOptions, TaskQueue, TaskRecord, TaskStatus,
};
pub use scan::{ScanError, ScanRules, ScanSummary, Scanner};
pub use startup::{run_startup_checks, StartupError};
pub use submit::{SubmitError, Submitter};
pub use task::{uhd_destination, Priority, TaskId, UpscaleTask};
pub use work_dir::WorkDir;
pub use worker::{Disposition, Worker, WorkerError, WorkerSummary};
