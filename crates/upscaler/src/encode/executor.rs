//! Encoding of a single chunk.
//!
//! The frame generator's stdout is wired directly into the encoder's stdin.
//! Both processes are supervised as one group: if either fails the other is
//! killed, and cancellation kills both. While they run, the encoder's
//! progress is forwarded to the heartbeat at a fixed interval.

use crate::chunk::Chunk;
use crate::concurrency::await_all;
use crate::config::{Config, EncoderConfig, ToolsConfig};
use crate::encode::commands::{encoder_command, frame_generator_command};
use crate::encode::process::{LoggedChild, ProcessError};
use crate::heartbeat::Heartbeat;
use crate::progress::ProgressMonitor;
use crate::task_log::TaskLog;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("failed to connect frame generator to encoder: {0}")]
    Pipe(#[source] io::Error),

    #[error("chunk encoding cancelled")]
    Cancelled,
}

/// What to encode and where.
#[derive(Debug, Clone, Copy)]
pub struct ChunkJob<'a> {
    pub input: &'a Path,
    pub decode_cache: &'a Path,
    pub chunk: &'a Chunk,
    pub output: &'a Path,
}

#[derive(Debug, Clone)]
pub struct ChunkExecutor {
    tools: ToolsConfig,
    encoder: EncoderConfig,
    heartbeat_interval: Duration,
}

impl ChunkExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            tools: config.tools.clone(),
            encoder: config.encoder.clone(),
            heartbeat_interval: Duration::from_secs(config.pipeline.heartbeat_interval_secs.max(1)),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Encode one chunk into `job.output`.
    ///
    /// On success both processes exited cleanly. A cancelled token always
    /// yields [`ChunkError::Cancelled`], whatever the processes reported.
    pub async fn encode(
        &self,
        job: ChunkJob<'_>,
        log: &TaskLog,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkError> {
        if cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }

        let mut generator_cmd =
            frame_generator_command(&self.tools, job.input, job.decode_cache, job.chunk);
        generator_cmd.stdin(Stdio::null()).stdout(Stdio::piped());
        let mut generator = LoggedChild::spawn(generator_cmd, log).await?;

        let frames = generator
            .take_stdout()
            .map(|out| -> io::Result<Stdio> { out.try_into() });
        let frames = match frames {
            Some(Ok(frames)) => frames,
            Some(Err(e)) => {
                generator.abort().await;
                return Err(ChunkError::Pipe(e));
            }
            None => {
                generator.abort().await;
                return Err(ChunkError::Pipe(io::Error::other("frame generator has no stdout")));
            }
        };

        let mut encoder_cmd = encoder_command(&self.tools, &self.encoder, job.output);
        encoder_cmd.stdin(frames).stdout(Stdio::piped());
        let mut encoder = match LoggedChild::spawn(encoder_cmd, log).await {
            Ok(encoder) => encoder,
            Err(e) => {
                generator.abort().await;
                return Err(e.into());
            }
        };

        let mut monitor = ProgressMonitor::new();
        if let Some(progress) = encoder.take_stdout() {
            monitor.attach(progress);
        }

        // A failing member cancels `stop`, never the caller's token
        let stop = cancel.child_token();
        let processes = await_all([
            generator.supervise(stop.clone()),
            encoder.supervise(stop.clone()),
        ]);
        tokio::pin!(processes);

        let first_tick = Instant::now() + self.heartbeat_interval;
        let mut ticker = interval_at(first_tick, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut processes => break result,
                _ = ticker.tick() => heartbeat.progress(&monitor.snapshot()).await,
            }
        };
        monitor.finish().await;
        debug!(chunk = %job.chunk, progress = %monitor, "chunk processes finished");

        if cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }
        result.map_err(ChunkError::from)
    }
}
