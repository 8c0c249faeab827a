//! Frame-range chunk planning.
//!
//! A transcode is cut into fixed-size, half-open frame ranges. Each chunk's
//! output file name encodes its start frame and the nominal chunk size, so
//! whether a chunk is done is a plain existence check in the work directory.

use std::fmt;
use std::ops::Range;

/// One contiguous frame range `[start, end)` of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the plan
    pub index: usize,
    /// First frame (inclusive)
    pub start: u64,
    /// Last frame (exclusive); clamped to the total frame count
    pub end: u64,
    /// Nominal chunk size the plan was built with
    pub size: u64,
}

impl Chunk {
    pub fn frames(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Final file name, e.g. `0007200+7200.mkv`.
    pub fn file_name(&self) -> String {
        format!("{:07}+{}.mkv", self.start, self.size)
    }

    /// In-progress file name, renamed to [`Chunk::file_name`] once complete.
    pub fn work_file_name(&self) -> String {
        format!("work-{:07}.mkv", self.start)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frames {}..{}", self.start, self.end)
    }
}

/// Split `total_frames` into chunks of `chunk_size` frames.
///
/// Produces `ceil(total / size)` chunks in increasing start order. A zero
/// chunk size is treated as one frame so the plan always terminates.
pub fn plan_chunks(total_frames: u64, chunk_size: u64) -> Vec<Chunk> {
    let size = chunk_size.max(1);
    (0..total_frames)
        .step_by(size as usize)
        .enumerate()
        .map(|(index, start)| Chunk {
            index,
            start,
            end: start.saturating_add(size).min(total_frames),
            size,
        })
        .collect()
}
