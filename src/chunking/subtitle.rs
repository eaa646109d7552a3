//! SubRip output built from chunk segments.
//!
//! Segments are placed on the global timeline by adding the chunk's window
//! start. Overlapping windows are not deduplicated, so neighbouring cues may
//! repeat or overlap near chunk boundaries.

use crate::chunking::result::ChunkResult;

/// One numbered subtitle cue.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleCue {
    pub number: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Collect cues from results sorted by index.
pub fn collect_cues(results: &[ChunkResult]) -> Vec<SubtitleCue> {
    let mut cues = Vec::new();
    for result in results.iter().filter(|r| r.success) {
        for segment in &result.segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            let start = result.window_start + segment.start;
            let end = (result.window_start + segment.end).max(start);
            cues.push(SubtitleCue {
                number: cues.len() + 1,
                start,
                end,
                text: text.to_string(),
            });
        }
    }
    cues
}

/// Render results as an SRT document.
pub fn build_srt(results: &[ChunkResult]) -> String {
    let mut out = String::new();
    for cue in collect_cues(results) {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            cue.number,
            format_srt_time(cue.start),
            format_srt_time(cue.end),
            cue.text
        ));
    }
    out
}

/// Format seconds as `HH:MM:SS,mmm`. Hours are not wrapped at 24.
pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1_000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1_000;
    let millis = total_ms % 1_000;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}
