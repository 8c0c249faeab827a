//! Concat demuxer manifest (`files.txt`).

use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Manifest being written for one run. Each entry is flushed as it is added.
#[derive(Debug)]
pub struct Manifest {
    file: File,
}

impl Manifest {
    /// Create or truncate the manifest at `path`.
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self { file })
    }

    pub async fn append(&mut self, chunk_file: &Path) -> io::Result<()> {
        self.file.write_all(entry(chunk_file).as_bytes()).await?;
        self.file.flush().await
    }

    pub async fn finish(self) -> io::Result<()> {
        self.file.sync_all().await
    }
}

/// One `file '<path>'` line. Single quotes in the path are closed, escaped
/// and reopened as the concat demuxer expects.
pub fn entry(path: &Path) -> String {
    let quoted = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{}'\n", quoted)
}
