//! Per-task scratch directory layout.
//!
//! ```text
//! <temp_dir>/<task id>/
//!   framecount         cached total frame count
//!   source.lwi         decoder index shared by all chunks
//!   files.txt          concat manifest
//!   work-0007200.mkv   chunk being encoded
//!   0000000+7200.mkv   finished chunks
//!   combined.mkv       concatenated result before the move
//!   upscale.log        task log
//! ```

use crate::chunk::Chunk;
use crate::task::TaskId;
use crate::task_log::TASK_LOG_FILE;
use std::io;
use std::path::{Path, PathBuf};

const FRAME_COUNT_FILE: &str = "framecount";
const MANIFEST_FILE: &str = "files.txt";
const COMBINED_FILE: &str = "combined.mkv";
const DECODE_CACHE_FILE: &str = "source.lwi";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for `id` under the configured temp root.
    pub fn for_task(temp_root: &Path, id: &TaskId) -> Self {
        Self::new(temp_root.join(id.as_str()))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn frame_count_file(&self) -> PathBuf {
        self.root.join(FRAME_COUNT_FILE)
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn combined_file(&self) -> PathBuf {
        self.root.join(COMBINED_FILE)
    }

    pub fn decode_cache(&self) -> PathBuf {
        self.root.join(DECODE_CACHE_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(TASK_LOG_FILE)
    }

    pub fn chunk_file(&self, chunk: &Chunk) -> PathBuf {
        self.root.join(chunk.file_name())
    }

    pub fn chunk_work_file(&self, chunk: &Chunk) -> PathBuf {
        self.root.join(chunk.work_file_name())
    }

    pub async fn create(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Delete every `.mkv` file directly inside the directory.
    ///
    /// Returns how many were removed.
    pub async fn remove_videos(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_video = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("mkv"))
                .unwrap_or(false);
            if is_video && entry.file_type().await?.is_file() {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete the directory and everything left in it.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
