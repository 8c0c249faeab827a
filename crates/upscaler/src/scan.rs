//! Scanner module for discovering episodes that need upscaling.
//!
//! A directory tree is only considered below a marker file (`.upscale` by
//! default); the marker activates its own directory and everything under it.
//! Within an active directory, files are grouped by season/episode key, and
//! every HD file whose episode has no UHD counterpart becomes a task.
//!
//! Subdirectories are scanned concurrently, one task each, and joined before
//! their parent's own files are submitted. Candidates within one directory are
//! submitted in file-name order; no order holds across sibling subtrees.

use crate::config::ScannerConfig;
use crate::submit::{SubmitError, Submitter};
use crate::task::{uhd_destination, Priority, UpscaleTask};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Season/episode key, with an optional multi-episode suffix (`S01E01-02`).
static EPISODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)S\d+E\d+(-\d+)?").expect("episode pattern should compile"));

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Failed to resolve scan root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to submit {path}: {source}")]
    Submit {
        path: PathBuf,
        #[source]
        source: SubmitError,
    },

    #[error("Scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Counts from one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    /// Directories listed successfully
    pub directories: usize,
    /// New tasks submitted
    pub submitted: usize,
    /// Candidates whose task already existed
    pub already_queued: usize,
    /// Subdirectories whose scan failed (logged and skipped)
    pub failed: usize,
}

impl ScanSummary {
    fn merge(&mut self, other: ScanSummary) {
        self.directories += other.directories;
        self.submitted += other.submitted;
        self.already_queued += other.already_queued;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Hd,
    Uhd,
}

#[derive(Debug, Default)]
struct EpisodeGroup<'a> {
    hd: Option<&'a str>,
    has_uhd: bool,
}

/// File naming rules the scanner applies.
#[derive(Debug, Clone)]
pub struct ScanRules {
    pub marker_file: String,
    pub extension: String,
    pub hd_tag: String,
    pub uhd_tags: Vec<String>,
    pub recent_window: Duration,
}

impl ScanRules {
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            marker_file: config.marker_file.clone(),
            extension: config.extension.trim_start_matches('.').to_string(),
            hd_tag: config.hd_tag.clone(),
            uhd_tags: config.uhd_tags.clone(),
            recent_window: Duration::from_secs(config.recent_window_hours.saturating_mul(3600)),
        }
    }

    /// Non-hidden file with the supported extension (case-insensitive).
    pub fn is_eligible(&self, name: &str) -> bool {
        if name.starts_with('.') {
            return false;
        }
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }

    /// Season/episode key of a file name, normalized to upper case.
    ///
    /// A range directly followed by a letter is a tag such as `-4k`, not a
    /// second episode, and is left out of the key.
    pub fn episode_key(name: &str) -> Option<String> {
        let captures = EPISODE_PATTERN.captures(name)?;
        let whole = captures.get(0)?;
        let tagged = name[whole.end()..].starts_with(|c: char| c.is_ascii_alphabetic());
        let key = match captures.get(1) {
            Some(range) if tagged => &name[whole.start()..range.start()],
            _ => whole.as_str(),
        };
        Some(key.to_ascii_uppercase())
    }

    fn resolution(&self, name: &str) -> Option<Resolution> {
        if name.contains(&self.hd_tag) {
            Some(Resolution::Hd)
        } else if self.uhd_tags.iter().any(|tag| name.contains(tag.as_str())) {
            Some(Resolution::Uhd)
        } else {
            None
        }
    }

    /// HD files of `names` whose episode has no UHD file, in name order.
    ///
    /// If an episode has several HD files, the first by name is used.
    pub fn select_candidates<'a>(&self, names: &'a [String]) -> Vec<&'a str> {
        let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
        sorted.sort_unstable();

        let mut groups: BTreeMap<String, EpisodeGroup<'a>> = BTreeMap::new();
        for name in sorted {
            let Some(key) = Self::episode_key(name) else {
                continue;
            };
            let Some(resolution) = self.resolution(name) else {
                continue;
            };
            let group = groups.entry(key).or_default();
            match resolution {
                Resolution::Hd => {
                    if group.hd.is_none() {
                        group.hd = Some(name);
                    }
                }
                Resolution::Uhd => group.has_uhd = true,
            }
        }

        let mut candidates: Vec<&str> = groups
            .into_values()
            .filter(|g| !g.has_uhd)
            .filter_map(|g| g.hd)
            .collect();
        candidates.sort_unstable();
        candidates
    }

    /// Destination for an HD file: HD tag replaced by the first UHD tag.
    pub fn destination(&self, input: &Path) -> Option<PathBuf> {
        let uhd_tag = self.uhd_tags.first()?;
        uhd_destination(input, &self.hd_tag, uhd_tag)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

type ScanFuture = Pin<Box<dyn Future<Output = Result<ScanSummary, ScanError>> + Send>>;

/// Walks directory trees and submits upscale tasks.
pub struct Scanner {
    rules: ScanRules,
    submitter: Submitter,
}

impl Scanner {
    pub fn new(rules: ScanRules, submitter: Submitter) -> Self {
        Self { rules, submitter }
    }

    /// Scan the tree under `root`.
    ///
    /// Failing to list `root` itself is an error; failures below it are
    /// logged and counted in [`ScanSummary::failed`].
    pub async fn scan(self: Arc<Self>, root: &Path) -> Result<ScanSummary, ScanError> {
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|source| ScanError::Root {
                path: root.to_path_buf(),
                source,
            })?;

        let active = self.marker_above(&root).await;
        if active {
            debug!(root = %root.display(), "marker found above scan root");
        }
        let summary = self.scan_dir(root.clone(), active).await?;
        info!(
            root = %root.display(),
            directories = summary.directories,
            submitted = summary.submitted,
            already_queued = summary.already_queued,
            failed = summary.failed,
            "Scan finished"
        );
        Ok(summary)
    }

    async fn marker_above(&self, dir: &Path) -> bool {
        for ancestor in dir.ancestors().skip(1) {
            if tokio::fs::try_exists(ancestor.join(&self.rules.marker_file))
                .await
                .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }

    fn scan_dir(self: Arc<Self>, dir: PathBuf, inherited_active: bool) -> ScanFuture {
        Box::pin(async move {
            let entries = list_dir(dir.clone()).await?;
            let active = inherited_active
                || entries.iter().any(|e| e.name == self.rules.marker_file);
            if active && !inherited_active {
                info!(dir = %dir.display(), "Found marker, activating");
            }

            let mut children = JoinSet::new();
            for sub in entries.iter().filter(|e| e.is_dir && !e.name.starts_with('.')) {
                children.spawn(Arc::clone(&self).scan_dir(sub.path.clone(), active));
            }

            let mut summary = ScanSummary {
                directories: 1,
                ..ScanSummary::default()
            };
            while let Some(joined) = children.join_next().await {
                match joined {
                    Ok(Ok(child)) => summary.merge(child),
                    Ok(Err(e)) => {
                        error!(error = %e, "Subdirectory scan failed");
                        summary.failed += 1;
                    }
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => return Err(e.into()),
                }
            }

            if !active {
                return Ok(summary);
            }

            let names: Vec<String> = entries
                .iter()
                .filter(|e| !e.is_dir && self.rules.is_eligible(&e.name))
                .map(|e| e.name.clone())
                .collect();
            for name in self.rules.select_candidates(&names) {
                let input = dir.join(name);
                let Some(output) = self.rules.destination(&input) else {
                    continue;
                };
                let priority = self.priority_for(&input).await;
                let task = UpscaleTask::new(input, output, priority);

                match self.submitter.submit(&task, false).await {
                    Ok(_) => summary.submitted += 1,
                    Err(SubmitError::Conflict(id)) => {
                        debug!(id = %id, input = %task.input.display(), "Already in queue");
                        summary.already_queued += 1;
                    }
                    Err(source) => {
                        return Err(ScanError::Submit {
                            path: task.input,
                            source,
                        })
                    }
                }
            }
            Ok(summary)
        })
    }

    /// Recently modified files go to the critical lane.
    async fn priority_for(&self, path: &Path) -> Priority {
        let age = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        match age {
            Some(age) => Priority::from_age(age, self.rules.recent_window),
            None => Priority::Default,
        }
    }
}

/// Direct children of `dir`, sorted by name.
async fn list_dir(dir: PathBuf) -> Result<Vec<Entry>, ScanError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<Entry>, ScanError> {
        let mut entries = Vec::new();
        let walker = walkdir::WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|source| ScanError::List {
                path: dir.clone(),
                source,
            })?;
            entries.push(Entry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path().to_path_buf(),
                is_dir: entry.file_type().is_dir(),
            });
        }
        Ok(entries)
    })
    .await?
}
