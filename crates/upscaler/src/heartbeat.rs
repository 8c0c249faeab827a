//! Liveness reporting for long-running tasks.

use crate::progress::ProgressSnapshot;
use async_trait::async_trait;
use tracing::debug;

/// Receives periodic progress details while a task runs.
///
/// Implementations must return quickly; they are called from the loop that
/// also watches for cancellation.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self, detail: &str);

    /// Encoder progress while a chunk runs; forwards its summary to `beat`.
    async fn progress(&self, snapshot: &ProgressSnapshot) {
        self.beat(&snapshot.to_string()).await;
    }
}

/// Heartbeat that only logs, for direct runs outside a queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHeartbeat;

#[async_trait]
impl Heartbeat for LogHeartbeat {
    async fn beat(&self, detail: &str) {
        debug!(detail, "heartbeat");
    }
}

#[cfg(test)]
pub use recording::RecordingHeartbeat;

#[cfg(test)]
mod recording {
    use super::Heartbeat;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Heartbeat that records every detail, used by tests.
    #[derive(Debug, Default)]
    pub struct RecordingHeartbeat {
        details: Mutex<Vec<String>>,
    }

    impl RecordingHeartbeat {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn details(&self) -> Vec<String> {
            self.details
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }

    #[async_trait]
    impl Heartbeat for RecordingHeartbeat {
        async fn beat(&self, detail: &str) {
            self.details
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(detail.to_string());
        }
    }
}
