//! Durable per-task log file.
//!
//! Every subprocess run by a task has its stdout/stderr split into lines and
//! appended to `upscale.log` inside the work directory, tagged with the
//! emitting process and stream, so a failed run can be inspected afterwards.

use crate::lines::LineBuffer;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// File name of the task log inside a work directory
pub const TASK_LOG_FILE: &str = "upscale.log";

const CUT_LINE: &str = "\n -------------- CUT HERE -------------- \n\n";

/// Append-only, line-oriented log shared by everything a task runs.
#[derive(Debug, Clone)]
pub struct TaskLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl TaskLog {
    /// Open (or create) the log at `path` in append mode.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one tagged line. Write failures are reported through tracing only.
    pub async fn line(&self, source: &str, line: &str) {
        let entry = format!("{} [{}] {}\n", timestamp_ms(), source, line);
        let mut file = self.file.lock().await;
        let result = match file.write_all(entry.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to write task log");
        }
    }

    /// Spawn a task that copies `reader` into the log line by line until EOF.
    pub fn capture<R>(&self, source: String, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.clone();
        tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in lines.push(&buf[..n]) {
                            log.line(&source, &line).await;
                        }
                    }
                    Err(e) => {
                        log.line(&source, &format!("<read error: {}>", e)).await;
                        break;
                    }
                }
            }
            if let Some(line) = lines.finish() {
                log.line(&source, &line).await;
            }
        })
    }

    /// Mark the end of a run.
    pub async fn close(&self) {
        let mut file = self.file.lock().await;
        let result = match file.write_all(CUT_LINE.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to close task log");
        }
    }
}

fn timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lines_are_tagged_and_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TASK_LOG_FILE);

        let log = TaskLog::open(&path).await.unwrap();
        log.line("worker", "Upscaling part").await;
        log.close().await;

        // Reopening appends instead of truncating
        let log = TaskLog::open(&path).await.unwrap();
        log.line("worker", "second run").await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("[worker] Upscaling part\n"));
        assert!(content.contains("CUT HERE"));
        assert!(content.contains("[worker] second run\n"));
        assert!(content.find("Upscaling part") < content.find("second run"));
    }

    #[tokio::test]
    async fn test_capture_splits_stream_into_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TASK_LOG_FILE);
        let log = TaskLog::open(&path).await.unwrap();

        let stderr = Cursor::new(b"frame=1 fps=0.5\rframe=2 fps=0.6\nwarning: tail".to_vec());
        log.capture("ffmpeg:stderr".to_string(), stderr).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let tagged: Vec<&str> = content
            .lines()
            .filter_map(|l| l.split_once(" [ffmpeg:stderr] ").map(|(_, rest)| rest))
            .collect();
        assert_eq!(tagged, vec!["frame=1 fps=0.5", "frame=2 fps=0.6", "warning: tail"]);
    }
}
