//! Upscale task payload, identity and priority lanes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Longest file-name prefix kept in a task identity.
const MAX_ID_PREFIX: usize = 96;

/// Work item: upscale `input` into `output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscaleTask {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub priority: Priority,
}

impl UpscaleTask {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, priority: Priority) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            priority,
        }
    }

    /// Identity of this task, derived from the output path only.
    pub fn id(&self) -> TaskId {
        TaskId::for_output(&self.output)
    }
}

/// Deterministic, filesystem-safe task identity.
///
/// Built as `<sanitized output file name>-<8 chars of url-safe sha256>`, so
/// two submissions targeting the same output always collide and the id is
/// usable as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn for_output(output: &Path) -> Self {
        let digest = Sha256::digest(output.to_string_lossy().as_bytes());
        let hash = URL_SAFE_NO_PAD.encode(&digest[..6]);

        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut prefix = sanitize(&name);
        if prefix.len() > MAX_ID_PREFIX {
            prefix.truncate(MAX_ID_PREFIX);
        }

        if prefix.is_empty() {
            Self(hash)
        } else {
            Self(format!("{}-{}", prefix, hash))
        }
    }

    /// Wrap an id read back from storage.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replace everything outside `[A-Za-z0-9._]` with `_`, collapsing runs.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    // Leading dots would make hidden directories
    out.trim_start_matches('.').to_string()
}

/// Scheduling lane. Higher lanes are always served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Default,
    Critical,
}

impl Priority {
    /// Lane for a file last modified `age` ago: recent files jump the queue.
    pub fn from_age(age: Duration, recent_window: Duration) -> Self {
        if age < recent_window {
            Priority::Critical
        } else {
            Priority::Default
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Default => "default",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" | "high" => Ok(Priority::Critical),
            "default" | "normal" => Ok(Priority::Default),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Output path for an HD file: the same path with `hd_tag` replaced by
/// `uhd_tag` in the file name. `None` when the name has no HD tag.
pub fn uhd_destination(input: &Path, hd_tag: &str, uhd_tag: &str) -> Option<PathBuf> {
    let name = input.file_name()?.to_str()?;
    if hd_tag.is_empty() || !name.contains(hd_tag) {
        return None;
    }
    Some(input.with_file_name(name.replacen(hd_tag, uhd_tag, 1)))
}
