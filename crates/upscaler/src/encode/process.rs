//! Child processes whose stderr is captured into the task log.

use crate::encode::commands::{describe, program_label};
use crate::task_log::TaskLog;
use std::io;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

/// A running child plus the tasks copying its output into the log.
#[derive(Debug)]
pub struct LoggedChild {
    child: Child,
    program: String,
    captures: Vec<JoinHandle<()>>,
}

impl LoggedChild {
    /// Spawn `cmd` with stderr piped into `log`.
    ///
    /// Stdin and stdout are left as the caller configured them. The command
    /// is consumed so no copy of its stdio handles stays open in this process.
    pub async fn spawn(mut cmd: Command, log: &TaskLog) -> Result<Self, ProcessError> {
        let program = program_label(&cmd);
        log.line(&program, &format!("Run {}", describe(&cmd))).await;

        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        drop(cmd);

        let mut captures = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            captures.push(log.capture(format!("{}:stderr", program), stderr));
        }
        debug!(program = %program, pid = ?child.id(), "spawned");

        Ok(Self {
            child,
            program,
            captures,
        })
    }

    /// Hand out the piped stdout, if the command was configured with one.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Copy stdout into the log as well.
    pub fn capture_stdout(&mut self, log: &TaskLog) {
        if let Some(stdout) = self.child.stdout.take() {
            self.captures
                .push(log.capture(format!("{}:stdout", self.program), stdout));
        }
    }

    /// Wait for exit as one member of a group sharing `stop`.
    ///
    /// A failed exit cancels `stop` so the other members are killed. Being
    /// killed because `stop` fired is not a failure of this member.
    pub async fn supervise(mut self, stop: CancellationToken) -> Result<(), ProcessError> {
        let outcome = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = stop.cancelled() => None,
        };

        let result = match outcome {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(ProcessError::Exit {
                program: self.program.clone(),
                status,
            }),
            Some(Err(source)) => Err(ProcessError::Wait {
                program: self.program.clone(),
                source,
            }),
            None => {
                self.kill().await;
                Ok(())
            }
        };

        if result.is_err() {
            stop.cancel();
        }
        self.drain().await;
        result
    }

    /// Wait for exit on its own, killing the child if `cancel` fires.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), ProcessError> {
        let outcome = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let result = match outcome {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(ProcessError::Exit {
                program: self.program.clone(),
                status,
            }),
            Some(Err(source)) => Err(ProcessError::Wait {
                program: self.program.clone(),
                source,
            }),
            None => {
                self.kill().await;
                Err(ProcessError::Cancelled {
                    program: self.program.clone(),
                })
            }
        };
        self.drain().await;
        result
    }

    /// Kill the child and wait for its output to be logged.
    pub async fn abort(mut self) {
        self.kill().await;
        self.drain().await;
    }

    async fn kill(&mut self) {
        debug!(program = %self.program, "killing");
        if let Err(e) = self.child.kill().await {
            // Already exited is the common case here
            debug!(program = %self.program, error = %e, "kill failed");
        }
    }

    async fn drain(&mut self) {
        for capture in self.captures.drain(..) {
            if let Err(e) = capture.await {
                warn!(program = %self.program, error = %e, "output capture task failed");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::concurrency::await_all;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open_log(dir: &TempDir) -> TaskLog {
        TaskLog::open(&dir.path().join("upscale.log")).await.unwrap()
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    #[tokio::test]
    async fn test_run_logs_stderr_and_reports_exit() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir).await;

        let child = LoggedChild::spawn(sh("echo oops >&2; exit 3"), &log).await.unwrap();
        let err = child.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Exit { ref status, .. } if status.code() == Some(3)));

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("[sh] Run sh -c"));
        assert!(content.contains("[sh:stderr] oops"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir).await;
        let err = LoggedChild::spawn(Command::new("/nonexistent/tool"), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { ref program, .. } if program == "tool"));
    }

    #[tokio::test]
    async fn test_run_is_cancellable() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir).await;
        let cancel = CancellationToken::new();

        let child = LoggedChild::spawn(sh("exec sleep 30"), &log).await.unwrap();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(10), child.run(&cancel))
            .await
            .expect("cancellation should be prompt");
        assert!(matches!(result, Err(ProcessError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_failed_member_kills_siblings() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir).await;
        let stop = CancellationToken::new();

        let failing = LoggedChild::spawn(sh("sleep 0.1; exit 1"), &log).await.unwrap();
        let long = LoggedChild::spawn(sh("exec sleep 30"), &log).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            await_all([failing.supervise(stop.clone()), long.supervise(stop.clone())]),
        )
        .await
        .expect("sibling should be killed");

        assert!(matches!(result, Err(ProcessError::Exit { .. })));
        assert!(stop.is_cancelled());
    }
}
