//! Upscale orchestrator
//!
//! Drives one task from input file to finished output:
//!
//! 1. return early if the output already exists
//! 2. count frames (cached in the work directory)
//! 3. plan chunks, write the manifest, encode every chunk that is not on disk
//! 4. concatenate the chunks, remux the other streams, move the result into place
//! 5. clean up the work directory
//!
//! Every chunk is written under a temporary name and renamed once complete,
//! so after any interruption a rerun resumes with the first missing chunk.

use crate::chunk::{plan_chunks, Chunk};
use crate::config::{Config, ToolsConfig};
use crate::encode::commands::concat_command;
use crate::encode::{ChunkError, ChunkExecutor, ChunkJob, LoggedChild, ProcessError};
use crate::frame_count::{count_frames, ProbeError};
use crate::heartbeat::Heartbeat;
use crate::manifest::Manifest;
use crate::replace::{move_file, ReplaceError};
use crate::task::UpscaleTask;
use crate::task_log::TaskLog;
use crate::work_dir::WorkDir;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Log tag for lines written by the orchestrator itself
const LOG_SOURCE: &str = "upscale";

/// Error type for an upscale run
#[derive(Debug, Error)]
pub enum UpscaleError {
    /// Input file does not exist
    #[error("Input file {0} does not exist")]
    InputMissing(PathBuf),

    /// Input has no video frames
    #[error("Input file {0} has no video frames")]
    EmptyInput(PathBuf),

    /// Work directory could not be prepared or written
    #[error("Work directory error at {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Counting frames failed
    #[error("Frame count failed: {0}")]
    Probe(#[from] ProbeError),

    /// Encoding a chunk failed
    #[error("Chunk {index} failed: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: ChunkError,
    },

    /// Concatenation or the final move failed
    #[error("Finalize failed: {0}")]
    Finalize(#[from] FinalizeError),

    /// Cancellation was requested
    #[error("Upscale cancelled")]
    Cancelled,
}

impl UpscaleError {
    /// Whether running the task again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UpscaleError::InputMissing(_) | UpscaleError::EmptyInput(_))
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("concat failed: {0}")]
    Concat(#[source] ProcessError),

    #[error("move to destination failed: {0}")]
    Move(#[from] ReplaceError),

    #[error("move task failed: {0}")]
    MoveTask(#[source] io::Error),
}

/// Stage of a run, reported in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleStage {
    Checking,
    Probing,
    Encoding,
    Finalizing,
    Cleaning,
}

impl UpscaleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpscaleStage::Checking => "checking",
            UpscaleStage::Probing => "probing",
            UpscaleStage::Encoding => "encoding",
            UpscaleStage::Finalizing => "finalizing",
            UpscaleStage::Cleaning => "cleaning",
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleOutcome {
    /// Output existed before the run; nothing was started
    AlreadyDone,
    /// Output was produced; `encoded` of `chunks` chunks were encoded by this run
    Completed { chunks: usize, encoded: usize },
}

/// Runs upscale tasks with a fixed configuration
#[derive(Debug, Clone)]
pub struct Upscaler {
    executor: ChunkExecutor,
    tools: ToolsConfig,
    frames_per_chunk: u64,
    temp_root: PathBuf,
    keep_logs: bool,
}

impl Upscaler {
    pub fn new(config: &Config) -> Self {
        Self {
            executor: ChunkExecutor::new(config),
            tools: config.tools.clone(),
            frames_per_chunk: config.pipeline.frames_per_chunk,
            temp_root: config.worker.temp_dir.clone(),
            keep_logs: config.pipeline.keep_logs,
        }
    }

    /// Work directory a task uses; stable across runs of the same task.
    pub fn work_dir(&self, task: &UpscaleTask) -> WorkDir {
        WorkDir::for_task(&self.temp_root, &task.id())
    }

    /// Run `task` to completion, resuming from whatever a previous run left.
    ///
    /// `heartbeat` receives progress while chunks encode; `cancel` stops the
    /// run promptly, killing any running subprocess.
    pub async fn run(
        &self,
        task: &UpscaleTask,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<UpscaleOutcome, UpscaleError> {
        debug!(stage = UpscaleStage::Checking.as_str(), input = %task.input.display(), "starting");
        if is_file(&task.output).await {
            info!(output = %task.output.display(), "Output already exists, nothing to do");
            return Ok(UpscaleOutcome::AlreadyDone);
        }
        if !is_file(&task.input).await {
            return Err(UpscaleError::InputMissing(task.input.clone()));
        }

        let work = self.work_dir(task);
        work.create().await.map_err(|source| UpscaleError::WorkDir {
            path: work.path().to_path_buf(),
            source,
        })?;
        let log = TaskLog::open(&work.log_file())
            .await
            .map_err(|source| UpscaleError::WorkDir {
                path: work.log_file(),
                source,
            })?;

        info!(
            input = %task.input.display(),
            output = %task.output.display(),
            work_dir = %work.path().display(),
            "Upscaling file"
        );
        log.line(
            LOG_SOURCE,
            &format!(
                "Upscaling file in={} out={} tmp={}",
                task.input.display(),
                task.output.display(),
                work.path().display()
            ),
        )
        .await;

        let result = self.run_in(task, &work, &log, heartbeat, cancel).await;
        match &result {
            Ok(outcome) => log.line(LOG_SOURCE, &format!("Finished: {:?}", outcome)).await,
            Err(e) => log.line(LOG_SOURCE, &format!("Failed: {}", e)).await,
        }
        log.close().await;

        if result.is_ok() && !self.keep_logs {
            debug!(stage = UpscaleStage::Cleaning.as_str(), "removing work directory");
            if let Err(e) = work.remove().await {
                warn!(
                    work_dir = %work.path().display(),
                    error = %e,
                    "failed to remove work directory"
                );
            }
        }
        result
    }

    async fn run_in(
        &self,
        task: &UpscaleTask,
        work: &WorkDir,
        log: &TaskLog,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<UpscaleOutcome, UpscaleError> {
        debug!(stage = UpscaleStage::Probing.as_str(), "counting frames");
        let total_frames = match count_frames(&self.tools, &task.input, work, log, cancel).await {
            Ok(frames) => frames,
            Err(ProbeError::Cancelled) => return Err(UpscaleError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        if total_frames == 0 {
            return Err(UpscaleError::EmptyInput(task.input.clone()));
        }

        let chunks = plan_chunks(total_frames, self.frames_per_chunk);
        log.line(
            LOG_SOURCE,
            &format!("{} frames in {} parts", total_frames, chunks.len()),
        )
        .await;

        debug!(stage = UpscaleStage::Encoding.as_str(), chunks = chunks.len(), "encoding");
        let manifest_path = work.manifest_file();
        let mut manifest = Manifest::create(&manifest_path)
            .await
            .map_err(|source| UpscaleError::WorkDir {
                path: manifest_path.clone(),
                source,
            })?;

        let mut encoded = 0;
        for chunk in &chunks {
            if cancel.is_cancelled() {
                return Err(UpscaleError::Cancelled);
            }

            let part = work.chunk_file(chunk);
            manifest
                .append(&part)
                .await
                .map_err(|source| UpscaleError::WorkDir {
                    path: manifest_path.clone(),
                    source,
                })?;

            if is_file(&part).await {
                debug!(part = %part.display(), "part already encoded");
                continue;
            }

            self.encode_chunk(task, work, chunk, chunks.len(), log, heartbeat, cancel)
                .await?;
            encoded += 1;
        }
        manifest
            .finish()
            .await
            .map_err(|source| UpscaleError::WorkDir {
                path: manifest_path.clone(),
                source,
            })?;

        self.finalize(task, work, log, heartbeat, cancel).await?;
        Ok(UpscaleOutcome::Completed {
            chunks: chunks.len(),
            encoded,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn encode_chunk(
        &self,
        task: &UpscaleTask,
        work: &WorkDir,
        chunk: &Chunk,
        total: usize,
        log: &TaskLog,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<(), UpscaleError> {
        let status = format!("Upscaling part {}/{} ({})", chunk.index + 1, total, chunk);
        info!(input = %task.input.display(), "{}", status);
        log.line(LOG_SOURCE, &status).await;
        heartbeat.beat(&status).await;

        let decode_cache = work.decode_cache();
        let work_file = work.chunk_work_file(chunk);
        let job = ChunkJob {
            input: &task.input,
            decode_cache: &decode_cache,
            chunk,
            output: &work_file,
        };
        self.executor
            .encode(job, log, heartbeat, cancel)
            .await
            .map_err(|e| match e {
                ChunkError::Cancelled => UpscaleError::Cancelled,
                source => UpscaleError::Chunk {
                    index: chunk.index,
                    source,
                },
            })?;

        let part = work.chunk_file(chunk);
        if let Err(source) = tokio::fs::rename(&work_file, &part).await {
            return Err(UpscaleError::WorkDir { path: part, source });
        }
        Ok(())
    }

    async fn finalize(
        &self,
        task: &UpscaleTask,
        work: &WorkDir,
        log: &TaskLog,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<(), UpscaleError> {
        debug!(stage = UpscaleStage::Finalizing.as_str(), "combining parts");
        log.line(LOG_SOURCE, "Combining parts").await;
        heartbeat.beat("Combining parts").await;

        let combined = work.combined_file();
        let mut cmd = concat_command(&self.tools, &work.manifest_file(), &task.input, &combined);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());
        let mut concat = LoggedChild::spawn(cmd, log)
            .await
            .map_err(FinalizeError::Concat)?;
        concat.capture_stdout(log);
        match concat.run(cancel).await {
            Ok(()) => {}
            Err(ProcessError::Cancelled { .. }) => return Err(UpscaleError::Cancelled),
            Err(e) => return Err(FinalizeError::Concat(e).into()),
        }

        let (src, dest) = (combined.clone(), task.output.clone());
        let method = tokio::task::spawn_blocking(move || move_file(&src, &dest))
            .await
            .map_err(|e| FinalizeError::MoveTask(io::Error::other(e)))?
            .map_err(FinalizeError::Move)?;
        info!(output = %task.output.display(), ?method, "Upscaled file in place");
        log.line(
            LOG_SOURCE,
            &format!("Moved {} to {} ({:?})", combined.display(), task.output.display(), method),
        )
        .await;

        // The output is already in place; leftovers only cost disk space
        match work.remove_videos().await {
            Ok(removed) => debug!(removed, "removed chunk files"),
            Err(e) => warn!(
                work_dir = %work.path().display(),
                error = %e,
                "failed to remove chunk files"
            ),
        }
        Ok(())
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
