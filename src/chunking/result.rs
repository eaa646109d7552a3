//! Per-chunk transcription results.

use crate::chunking::planner::ChunkDescriptor;
use serde::{Deserialize, Serialize};

/// A timed piece of text, relative to the start of the chunk audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Outcome of transcribing one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub index: usize,
    pub success: bool,
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TimedSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Absolute start of the chunk audio (its padded start), used to place
    /// segments on the global timeline
    #[serde(default)]
    pub window_start: f64,
}

impl ChunkResult {
    pub fn success(chunk: &ChunkDescriptor, text: String, segments: Vec<TimedSegment>) -> Self {
        Self {
            index: chunk.index,
            success: true,
            text,
            segments,
            error: None,
            window_start: chunk.padded_start,
        }
    }

    pub fn failure(chunk: &ChunkDescriptor, error: impl Into<String>) -> Self {
        Self {
            index: chunk.index,
            success: false,
            text: String::new(),
            segments: Vec::new(),
            error: Some(error.into()),
            window_start: chunk.padded_start,
        }
    }

    /// Text this chunk contributes to the merged transcript.
    ///
    /// Failed chunks contribute an empty span.
    pub fn contributed_text(&self) -> &str {
        if self.success { &self.text } else { "" }
    }
}

/// Sort results by index, keeping the first result reported for each index.
pub fn sort_results(mut results: Vec<ChunkResult>) -> Vec<ChunkResult> {
    results.sort_by_key(|r| r.index);
    results.dedup_by_key(|r| r.index);
    results
}

/// Planned indices in `0..planned` with no result.
pub fn missing_indices(results: &[ChunkResult], planned: usize) -> Vec<usize> {
    let mut seen = vec![false; planned];
    for result in results {
        if let Some(slot) = seen.get_mut(result.index) {
            *slot = true;
        }
    }
    seen.iter()
        .enumerate()
        .filter_map(|(index, present)| (!present).then_some(index))
        .collect()
}
