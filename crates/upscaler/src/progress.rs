//! Encoder progress monitor.
//!
//! ffmpeg started with `-progress pipe:1` writes blocks of `key=value` lines
//! to its stdout every stats period. The monitor parses the `fps`,
//! `out_time`, `bitrate`, `speed` and `stream_*_q` keys into a snapshot that
//! the heartbeat loop reads while the encoder is running. One monitor belongs
//! to exactly one encoder invocation.

use crate::lines::LineBuffer;
use std::fmt;
use std::io;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Consecutive read errors after which the channel is abandoned.
const MAX_READ_FAILURES: u32 = 8;

/// Last known encoder progress values, kept as reported by ffmpeg.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub fps: String,
    pub out_time: String,
    /// e.g. `6075.7kbits/s`
    pub bitrate: String,
    /// e.g. `0.394x`
    pub speed: String,
    /// Quantizer of the video stream (`stream_0_0_q`)
    pub quality: String,
}

impl ProgressSnapshot {
    /// Apply one progress line; returns false for keys that are not tracked.
    pub fn apply_line(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "fps" => self.fps = value,
            "out_time" => self.out_time = value,
            "bitrate" => self.bitrate = value,
            "speed" => self.speed = value,
            key if key.starts_with("stream_") && key.ends_with("_q") => self.quality = value,
            _ => return false,
        }
        true
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Current FPS: {}, Time: {}", self.fps, self.out_time)
    }
}

/// Live view of an encoder's progress channel.
#[derive(Debug, Default)]
pub struct ProgressMonitor {
    snapshot: Arc<RwLock<ProgressSnapshot>>,
    reader: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoder arguments that route its progress reports to stdout.
    pub fn encoder_args(stats_period_secs: u64) -> Vec<String> {
        vec![
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-stats_period".to_string(),
            stats_period_secs.to_string(),
        ]
    }

    /// Start consuming the progress channel in a background task.
    ///
    /// The task reads until EOF, which happens when the encoder exits or is
    /// killed, so the encoder never blocks on a full pipe. After a read error
    /// the rest of the channel is drained and discarded.
    pub fn attach<R>(&mut self, mut channel: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let snapshot = Arc::clone(&self.snapshot);
        self.reader = Some(tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut buf = [0u8; 4096];
            let mut parsing = true;
            let mut failures = 0;
            loop {
                match channel.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        failures = 0;
                        if !parsing {
                            continue;
                        }
                        let completed = lines.push(&buf[..n]);
                        if completed.is_empty() {
                            continue;
                        }
                        let mut guard = snapshot.write().unwrap_or_else(|e| e.into_inner());
                        for line in completed {
                            guard.apply_line(&line);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if parsing {
                            debug!(error = %e, "progress channel read failed, discarding the rest");
                            parsing = false;
                        }
                        failures += 1;
                        if failures >= MAX_READ_FAILURES {
                            warn!(error = %e, "giving up on progress channel");
                            break;
                        }
                    }
                }
            }
            if !parsing {
                return;
            }
            if let Some(line) = lines.finish() {
                let mut guard = snapshot.write().unwrap_or_else(|e| e.into_inner());
                guard.apply_line(&line);
            }
        }));
    }

    /// Copy of the most recent values.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait for the reader task to reach EOF.
    pub async fn finish(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

impl fmt::Display for ProgressMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    /// Channel that replays a fixed sequence of reads, then reports EOF.
    struct Scripted {
        reads: VecDeque<io::Result<&'static [u8]>>,
        reached_eof: Arc<AtomicBool>,
    }

    impl Scripted {
        fn new(reads: Vec<io::Result<&'static [u8]>>) -> (Self, Arc<AtomicBool>) {
            let reached_eof = Arc::new(AtomicBool::new(false));
            let channel = Self {
                reads: reads.into(),
                reached_eof: Arc::clone(&reached_eof),
            };
            (channel, reached_eof)
        }
    }

    impl AsyncRead for Scripted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    buf.put_slice(data);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => {
                    self.reached_eof.store(true, Ordering::SeqCst);
                    Poll::Ready(Ok(()))
                }
            }
        }
    }

    fn broken() -> io::Error {
        io::Error::other("read failed")
    }

    const SAMPLE: &str = "frame=483\nfps=9.55\nstream_0_0_q=19.0\nbitrate=6075.7kbits/s\n\
total_size=15204352\nout_time_us=20020000\nout_time_ms=20020000\nout_time=00:00:20.020000\n\
dup_frames=0\ndrop_frames=0\nspeed=0.394x\nprogress=continue\n";

    #[test]
    fn test_apply_line_tracks_known_keys() {
        let mut snapshot = ProgressSnapshot::default();
        assert!(snapshot.apply_line("fps=9.55"));
        assert!(snapshot.apply_line("out_time=00:00:20.020000"));
        assert!(snapshot.apply_line("speed=0.394x"));
        assert!(snapshot.apply_line("bitrate=6075.7kbits/s"));
        assert!(snapshot.apply_line("stream_0_0_q=19.0"));
        assert!(!snapshot.apply_line("out_time_ms=20020000"));
        assert!(!snapshot.apply_line("stream_0_0_psnr=40.0"));
        assert!(!snapshot.apply_line("garbage"));
        assert_eq!(snapshot.fps, "9.55");
        assert_eq!(snapshot.out_time, "00:00:20.020000");
        assert_eq!(snapshot.speed, "0.394x");
        assert_eq!(snapshot.bitrate, "6075.7kbits/s");
        assert_eq!(snapshot.quality, "19.0");
    }

    #[test]
    fn test_display_summary() {
        let snapshot = ProgressSnapshot {
            fps: "9.58".to_string(),
            out_time: "00:00:22.105000".to_string(),
            speed: "0.4x".to_string(),
            ..ProgressSnapshot::default()
        };
        assert_eq!(snapshot.to_string(), "Current FPS: 9.58, Time: 00:00:22.105000");
    }

    #[test]
    fn test_encoder_args() {
        assert_eq!(
            ProgressMonitor::encoder_args(10),
            vec!["-progress", "pipe:1", "-stats_period", "10"]
        );
    }

    #[tokio::test]
    async fn test_monitor_parses_stream_until_eof() {
        let mut monitor = ProgressMonitor::new();
        monitor.attach(Cursor::new(SAMPLE.as_bytes().to_vec()));
        monitor.finish().await;

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.fps, "9.55");
        assert_eq!(snapshot.out_time, "00:00:20.020000");
        assert_eq!(monitor.to_string(), "Current FPS: 9.55, Time: 00:00:20.020000");
    }

    #[tokio::test]
    async fn test_monitor_handles_lines_split_across_writes() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut monitor = ProgressMonitor::new();
        monitor.attach(reader);

        writer.write_all(b"fps=1").await.unwrap();
        writer.flush().await.unwrap();
        tokio::task::yield_now().await;
        writer.write_all(b"2.5\nout_time=00:01").await.unwrap();
        writer.write_all(b":00.000000\nfps=13.0").await.unwrap();
        drop(writer);

        monitor.finish().await;
        let snapshot = monitor.snapshot();
        // Trailing unterminated line is applied at EOF (last write wins)
        assert_eq!(snapshot.fps, "13.0");
        assert_eq!(snapshot.out_time, "00:01:00.000000");
    }

    #[tokio::test]
    async fn test_snapshot_is_empty_before_any_progress() {
        let monitor = ProgressMonitor::new();
        assert_eq!(monitor.snapshot(), ProgressSnapshot::default());
        assert_eq!(monitor.to_string(), "Current FPS: , Time: ");
    }

    #[tokio::test]
    async fn test_read_error_keeps_draining_to_eof() {
        let (channel, reached_eof) = Scripted::new(vec![
            Ok("fps=1.0\nout_time=00:00:01.000000\n".as_bytes()),
            Err(broken()),
            Ok("fps=2.0\n".as_bytes()),
            Ok("out_time=00:00:02.000000\nfps=3.0".as_bytes()),
        ]);
        let mut monitor = ProgressMonitor::new();
        monitor.attach(channel);
        monitor.finish().await;

        assert!(reached_eof.load(Ordering::SeqCst));
        // Nothing after the error is trusted
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.fps, "1.0");
        assert_eq!(snapshot.out_time, "00:00:01.000000");
    }

    #[tokio::test]
    async fn test_interrupted_read_is_retried() {
        let (channel, reached_eof) = Scripted::new(vec![
            Ok("fps=1.0\n".as_bytes()),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok("fps=2.0\n".as_bytes()),
        ]);
        let mut monitor = ProgressMonitor::new();
        monitor.attach(channel);
        monitor.finish().await;

        assert!(reached_eof.load(Ordering::SeqCst));
        assert_eq!(monitor.snapshot().fps, "2.0");
    }

    #[tokio::test]
    async fn test_persistent_read_errors_end_the_reader() {
        let reads = (0..MAX_READ_FAILURES * 4).map(|_| Err(broken())).collect();
        let (channel, reached_eof) = Scripted::new(reads);
        let mut monitor = ProgressMonitor::new();
        monitor.attach(channel);

        tokio::time::timeout(Duration::from_secs(5), monitor.finish())
            .await
            .expect("reader should stop after repeated failures");
        assert!(!reached_eof.load(Ordering::SeqCst));
        assert_eq!(monitor.snapshot(), ProgressSnapshot::default());
    }
}
