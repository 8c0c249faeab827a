//! Directory-backed task queue.
//!
//! Each task is one `<id>.json` file in the state directory. Records are
//! replaced atomically (write to a hidden temp file, then rename), and a new
//! identity is claimed with a hard link so two submitters cannot both win.
//! Every state change holds an exclusive `flock` on `<dir>/.lock`, so
//! workers and submitters in separate processes can share one directory.

use super::{Delivery, QueueError, SubmitOptions, TaskQueue, TaskRecord, TaskStatus};
use crate::task::{TaskId, UpscaleTask};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a running task may go without a heartbeat before it is redelivered.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);

const LOCK_FILE: &str = ".lock";

/// Exclusive hold on the queue state, released on drop.
struct StateGuard<'a> {
    #[cfg(unix)]
    _file: nix::fcntl::Flock<std::fs::File>,
    _local: MutexGuard<'a, ()>,
}

#[derive(Debug)]
pub struct FileQueue {
    dir: PathBuf,
    lease: Duration,
    lock: Mutex<()>,
}

impl FileQueue {
    /// Open the queue in `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lease: DEFAULT_LEASE,
            lock: Mutex::new(()),
        })
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current record of a task.
    pub async fn record(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let _guard = self.lock.lock().await;
        self.read_record(id).await
    }

    /// Every readable record, oldest first.
    pub async fn records(&self) -> Result<Vec<TaskRecord>, QueueError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load_all().await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn record_path(&self, id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn temp_path(&self, id: &TaskId) -> PathBuf {
        self.dir.join(format!(".{}.{}.tmp", id, Uuid::new_v4()))
    }

    async fn read_record(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        read_record_file(&self.record_path(id)).await
    }

    async fn write_temp(&self, record: &TaskRecord) -> Result<PathBuf, QueueError> {
        let temp = self.temp_path(&record.id);
        let json = serde_json::to_vec_pretty(record).map_err(|source| QueueError::Corrupt {
            path: temp.clone(),
            source,
        })?;
        tokio::fs::write(&temp, json).await?;
        Ok(temp)
    }

    /// Replace the stored record.
    async fn save(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let temp = self.write_temp(record).await?;
        if let Err(e) = tokio::fs::rename(&temp, self.record_path(&record.id)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Store a record only if none exists under its id.
    async fn create(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let temp = self.write_temp(record).await?;
        let claimed = tokio::fs::hard_link(&temp, self.record_path(&record.id)).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match claimed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(QueueError::Conflict(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &TaskId) -> Result<(), QueueError> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(QueueError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Load all records, skipping files that fail to parse.
    async fn load_all(&self) -> Result<Vec<TaskRecord>, QueueError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record_file(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable task record")
                }
            }
        }
        Ok(records)
    }

    /// Record for `delivery`, provided the delivery still owns it.
    async fn owned_record(&self, delivery: &Delivery) -> Result<TaskRecord, QueueError> {
        match self.read_record(&delivery.id).await? {
            Some(record)
                if record.status == TaskStatus::Running
                    && record.delivery == Some(delivery.token) =>
            {
                Ok(record)
            }
            _ => Err(QueueError::Stale(delivery.id.clone())),
        }
    }

    fn lease_deadline(&self, now: i64) -> i64 {
        now.saturating_add(self.lease.as_millis() as i64)
    }

    /// Serialize a state change against this process and every other one
    /// using the same directory.
    async fn lock_state(&self) -> Result<StateGuard<'_>, QueueError> {
        let local = self.lock.lock().await;
        #[cfg(unix)]
        let guard = StateGuard {
            _file: lock_file(self.dir.join(LOCK_FILE)).await?,
            _local: local,
        };
        #[cfg(not(unix))]
        let guard = StateGuard { _local: local };
        Ok(guard)
    }
}

#[cfg(unix)]
async fn lock_file(path: PathBuf) -> io::Result<nix::fcntl::Flock<std::fs::File>> {
    use nix::fcntl::{Flock, FlockArg};

    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| io::Error::from(errno))
    })
    .await
    .map_err(io::Error::other)?
}

#[async_trait]
impl TaskQueue for FileQueue {
    async fn submit(
        &self,
        id: &TaskId,
        task: &UpscaleTask,
        options: &SubmitOptions,
    ) -> Result<(), QueueError> {
        let _guard = self.lock_state().await?;
        let now = current_timestamp_ms();

        if let Some(existing) = self.read_record(id).await? {
            if !retention_expired(&existing, now) {
                return Err(QueueError::Conflict(id.clone()));
            }
            debug!(id = %id, "purging finished task past retention");
            self.delete(id).await?;
        }

        let record = TaskRecord {
            id: id.clone(),
            task: task.clone(),
            options: *options,
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            lease_expires_at: None,
            delivery: None,
            progress: None,
            last_error: None,
            finished_at: None,
        };
        self.create(&record).await
    }

    async fn remove(&self, id: &TaskId) -> Result<(), QueueError> {
        let _guard = self.lock_state().await?;
        self.delete(id).await
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let _guard = self.lock_state().await?;
        let now = current_timestamp_ms();

        let mut next: Option<TaskRecord> = None;
        for mut record in self.load_all().await? {
            match record.status {
                TaskStatus::Completed | TaskStatus::Failed => {
                    if retention_expired(&record, now) {
                        debug!(id = %record.id, "purging finished task past retention");
                        self.delete(&record.id).await?;
                    }
                    continue;
                }
                TaskStatus::Running => {
                    if record.lease_expires_at.map(|t| t > now).unwrap_or(false) {
                        continue;
                    }
                    if record.attempts > record.options.max_retries {
                        warn!(id = %record.id, "abandoned task has no retries left");
                        finish(&mut record, TaskStatus::Failed, now);
                        record.last_error = Some("lease expired".to_string());
                        self.save(&record).await?;
                        continue;
                    }
                    warn!(
                        id = %record.id,
                        attempts = record.attempts,
                        "redelivering abandoned task"
                    );
                }
                TaskStatus::Pending => {}
            }

            let better = match &next {
                None => true,
                Some(current) => schedule_key(&record) < schedule_key(current),
            };
            if better {
                next = Some(record);
            }
        }

        let Some(mut record) = next else {
            return Ok(None);
        };
        let token = Uuid::new_v4();
        record.status = TaskStatus::Running;
        record.attempts += 1;
        record.delivery = Some(token);
        record.lease_expires_at = Some(self.lease_deadline(now));
        record.updated_at = now;
        self.save(&record).await?;

        info!(
            id = %record.id,
            priority = %record.task.priority,
            attempt = record.attempts,
            "dequeued task"
        );
        Ok(Some(Delivery {
            id: record.id,
            task: record.task,
            attempt: record.attempts,
            timeout: record.options.timeout(),
            token,
        }))
    }

    async fn heartbeat(&self, delivery: &Delivery, detail: &str) -> Result<(), QueueError> {
        let _guard = self.lock_state().await?;
        let now = current_timestamp_ms();
        let mut record = self.owned_record(delivery).await?;
        record.lease_expires_at = Some(self.lease_deadline(now));
        if !detail.is_empty() {
            record.progress = Some(detail.to_string());
        }
        record.updated_at = now;
        self.save(&record).await
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let _guard = self.lock_state().await?;
        let now = current_timestamp_ms();
        let mut record = self.owned_record(delivery).await?;
        finish(&mut record, TaskStatus::Completed, now);
        self.save(&record).await
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<(), QueueError> {
        let _guard = self.lock_state().await?;
        let now = current_timestamp_ms();
        let mut record = self.owned_record(delivery).await?;
        record.last_error = Some(error.to_string());

        if retryable && record.attempts <= record.options.max_retries {
            debug!(id = %record.id, attempts = record.attempts, "requeueing failed task");
            record.status = TaskStatus::Pending;
            record.delivery = None;
            record.lease_expires_at = None;
            record.updated_at = now;
        } else {
            finish(&mut record, TaskStatus::Failed, now);
        }
        self.save(&record).await
    }
}

/// Highest priority first, then oldest, then by id for a stable order.
fn schedule_key(record: &TaskRecord) -> (Reverse<crate::task::Priority>, i64, &TaskId) {
    (Reverse(record.task.priority), record.created_at, &record.id)
}

fn finish(record: &mut TaskRecord, status: TaskStatus, now: i64) {
    record.status = status;
    record.delivery = None;
    record.lease_expires_at = None;
    record.finished_at = Some(now);
    record.updated_at = now;
}

fn retention_expired(record: &TaskRecord, now: i64) -> bool {
    match (record.status.is_finished(), record.finished_at) {
        (true, Some(finished_at)) => {
            let retention_ms = record.options.retention_secs.saturating_mul(1000) as i64;
            now >= finished_at.saturating_add(retention_ms)
        }
        _ => false,
    }
}

async fn read_record_file(path: &Path) -> Result<Option<TaskRecord>, QueueError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| QueueError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Get current timestamp in milliseconds since Unix epoch.
fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
