//! Total frame count of an input, probed once per task and cached.

use crate::config::ToolsConfig;
use crate::encode::commands::{describe, frame_count_command, program_label};
use crate::task_log::TaskLog;
use crate::work_dir::WorkDir;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },

    #[error("unexpected frame count output: {0:?}")]
    Unparsable(String),

    #[error("frame count cancelled")]
    Cancelled,
}

/// Number of video frames in `input`.
///
/// A cached value in the work directory is used when present and readable;
/// otherwise ffprobe runs and its answer is cached. Failing to write the
/// cache is not an error. Cancelling `cancel` kills ffprobe.
pub async fn count_frames(
    tools: &ToolsConfig,
    input: &Path,
    work_dir: &WorkDir,
    log: &TaskLog,
    cancel: &CancellationToken,
) -> Result<u64, ProbeError> {
    let cache = work_dir.frame_count_file();
    if let Ok(content) = tokio::fs::read_to_string(&cache).await {
        match parse_frame_count(&content) {
            Ok(frames) => {
                debug!(frames, cache = %cache.display(), "using cached frame count");
                return Ok(frames);
            }
            Err(_) => warn!(cache = %cache.display(), "ignoring unreadable frame count cache"),
        }
    }

    let mut cmd = frame_count_command(tools, input);
    let program = program_label(&cmd);
    log.line(&program, &format!("Run {}", describe(&cmd))).await;

    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProbeError::Spawn {
            program: program.clone(),
            source,
        })?;

    // Dropping the pending wait drops the child, which kill_on_drop kills
    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|source| ProbeError::Spawn {
            program: program.clone(),
            source,
        })?,
        _ = cancel.cancelled() => {
            log.line(&program, "Cancelled").await;
            return Err(ProbeError::Cancelled);
        }
    };

    let stderr_tag = format!("{}:stderr", program);
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        log.line(&stderr_tag, line).await;
    }
    if !output.status.success() {
        return Err(ProbeError::Failed {
            program,
            status: output.status,
        });
    }

    let frames = parse_frame_count(&String::from_utf8_lossy(&output.stdout))?;
    if let Err(e) = tokio::fs::write(&cache, frames.to_string()).await {
        warn!(cache = %cache.display(), error = %e, "failed to cache frame count");
    }
    Ok(frames)
}

/// Parse the ffprobe output: the first non-empty line, as an integer.
pub fn parse_frame_count(output: &str) -> Result<u64, ProbeError> {
    let first = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    // Some containers report a trailing separator
    first
        .trim_end_matches(',')
        .parse::<u64>()
        .map_err(|_| ProbeError::Unparsable(output.trim().to_string()))
}
