//! Overlapping window planner.
//!
//! Splits a duration into fixed core windows that tile `[0, D)` exactly and
//! pads every window with up to `overlap` seconds on each side:
//!
//! ```text
//! core:    [0 ........ 20)[20 ....... 40)[40 ....... 60)[60 .. 63)
//! padded:  [0 ........... 23)
//!                     [17 ........... 43)
//!                                   [37 ........... 63)
//!                                                 [57 ...... 63)
//! ```

use crate::error::{Result, TranscriptorError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One planned window of the input audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Dense 0-based index
    pub index: usize,
    pub core_start: f64,
    pub core_end: f64,
    /// Core start minus overlap, clamped at 0
    pub padded_start: f64,
    /// Core end plus overlap, clamped at the total duration
    pub padded_end: f64,
    /// Location of the extracted chunk audio
    pub file: PathBuf,
}

impl ChunkDescriptor {
    pub fn core_duration(&self) -> f64 {
        self.core_end - self.core_start
    }

    pub fn padded_duration(&self) -> f64 {
        self.padded_end - self.padded_start
    }

    /// Padding actually applied before the core window.
    pub fn left_overlap(&self) -> f64 {
        self.core_start - self.padded_start
    }

    /// Padding actually applied after the core window.
    pub fn right_overlap(&self) -> f64 {
        self.padded_end - self.core_end
    }

    /// Stable key used by checkpoints and artifacts (`chunk_001` for index 0).
    pub fn key(&self) -> String {
        chunk_key(self.index)
    }
}

/// Checkpoint/artifact key for a chunk index.
pub fn chunk_key(index: usize) -> String {
    format!("chunk_{:03}", index + 1)
}

/// File name of the extracted audio for a chunk index.
pub fn chunk_file_name(index: usize, extension: &str) -> String {
    format!("{}.{}", chunk_key(index), extension)
}

/// Planner for overlapping windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPlanner {
    window_secs: f64,
    overlap_secs: f64,
}

impl ChunkPlanner {
    /// Create a planner, rejecting non-positive windows and negative overlap.
    pub fn new(window_secs: f64, overlap_secs: f64) -> Result<Self> {
        if !(window_secs.is_finite() && window_secs > 0.0) {
            return Err(TranscriptorError::InvalidPlan {
                message: format!("window must be positive, got {window_secs}"),
            });
        }
        if !(overlap_secs.is_finite() && overlap_secs >= 0.0) {
            return Err(TranscriptorError::InvalidPlan {
                message: format!("overlap must not be negative, got {overlap_secs}"),
            });
        }
        Ok(Self {
            window_secs,
            overlap_secs,
        })
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }

    pub fn overlap_secs(&self) -> f64 {
        self.overlap_secs
    }

    /// Number of windows for `duration`: ⌈D / C⌉, or 0 for an empty input.
    pub fn chunk_count(&self, duration: f64) -> usize {
        if !(duration.is_finite() && duration > 0.0) {
            return 0;
        }
        let mut count = (duration / self.window_secs).ceil() as usize;
        // D / C can round up past an exact multiple (1.1 / 0.1 = 11.000000000000002);
        // never plan a window whose core would start at or after D.
        while count > 1 && (count - 1) as f64 * self.window_secs >= duration {
            count -= 1;
        }
        count.max(1)
    }

    /// Plan windows for `duration`, with chunk files named relative to no directory.
    pub fn plan(&self, duration: f64) -> Vec<ChunkDescriptor> {
        self.plan_in(duration, Path::new(""), "wav")
    }

    /// Plan windows for `duration`, placing chunk files in `dir`.
    pub fn plan_in(&self, duration: f64, dir: &Path, extension: &str) -> Vec<ChunkDescriptor> {
        let count = self.chunk_count(duration);
        (0..count)
            .map(|index| {
                let core_start = index as f64 * self.window_secs;
                let core_end = if index + 1 == count {
                    duration
                } else {
                    ((index + 1) as f64 * self.window_secs).min(duration)
                };
                ChunkDescriptor {
                    index,
                    core_start,
                    core_end,
                    padded_start: (core_start - self.overlap_secs).max(0.0),
                    padded_end: (core_end + self.overlap_secs).min(duration),
                    file: dir.join(chunk_file_name(index, extension)),
                }
            })
            .collect()
    }
}

/// Shared region between two neighbouring windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapRegion {
    pub start: f64,
    pub end: f64,
    /// Index of the neighbouring chunk that also covers this region
    pub shared_with: usize,
}

/// Per-chunk overlap layout, used to annotate artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeInfo {
    pub index: usize,
    pub core_start: f64,
    pub core_end: f64,
    pub left: Option<OverlapRegion>,
    pub right: Option<OverlapRegion>,
}

/// Describe, for every chunk, the regions it shares with its neighbours.
pub fn merge_info(chunks: &[ChunkDescriptor]) -> Vec<MergeInfo> {
    chunks
        .iter()
        .enumerate()
        .map(|(pos, chunk)| {
            let left = (pos > 0 && chunk.left_overlap() > 0.0).then(|| OverlapRegion {
                start: chunk.padded_start,
                end: chunk.core_start,
                shared_with: chunks[pos - 1].index,
            });
            let right = (pos + 1 < chunks.len() && chunk.right_overlap() > 0.0).then(|| {
                OverlapRegion {
                    start: chunk.core_end,
                    end: chunk.padded_end,
                    shared_with: chunks[pos + 1].index,
                }
            });
            MergeInfo {
                index: chunk.index,
                core_start: chunk.core_start,
                core_end: chunk.core_end,
                left,
                right,
            }
        })
        .collect()
}
