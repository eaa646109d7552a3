//! Overlap-aware transcript merger.
//!
//! Neighbouring chunks are transcribed from audio that overlaps by a few
//! seconds, so the tail of one chunk's text usually reappears at the head of
//! the next. The merger looks for the longest whitespace-normalized
//! suffix/prefix match within `[min_overlap, max_overlap]` characters and
//! drops the repeated head. When nothing matches, the chunk is appended
//! unchanged: a missed overlap costs a duplicated phrase, never lost text.

use crate::chunking::result::ChunkResult;
use crate::config::MergeConfig;
use crate::defaults;

/// Tunable bounds for the overlap scan.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    /// Longest candidate overlap, in characters
    pub max_overlap: usize,
    /// Shortest overlap accepted as a match, in characters
    pub min_overlap: usize,
    /// Inserted between consecutive chunk texts
    pub boundary: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            max_overlap: defaults::MERGE_MAX_OVERLAP_CHARS,
            min_overlap: defaults::MERGE_MIN_OVERLAP_CHARS,
            boundary: defaults::MERGE_BOUNDARY.to_string(),
        }
    }
}

impl From<&MergeConfig> for MergeOptions {
    fn from(config: &MergeConfig) -> Self {
        Self {
            max_overlap: config.max_overlap,
            min_overlap: config.min_overlap.max(1),
            boundary: config.boundary.clone(),
        }
    }
}

/// Merged transcript plus the overlap removed before each appended chunk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    pub text: String,
    /// `(chunk index, characters dropped)` for every detected overlap
    pub overlaps: Vec<(usize, usize)>,
}

/// Stitches sorted chunk texts into one transcript.
#[derive(Debug, Clone, Default)]
pub struct ResultMerger {
    options: MergeOptions,
}

impl ResultMerger {
    pub fn new(options: MergeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merge results that are already sorted by chunk index.
    pub fn merge(&self, results: &[ChunkResult]) -> MergeOutcome {
        debug_assert!(
            results.windows(2).all(|w| w[0].index < w[1].index),
            "merge requires results sorted by index"
        );
        self.merge_texts(results.iter().map(|r| (r.index, r.contributed_text())))
    }

    /// Merge `(index, text)` pairs in the given order.
    pub fn merge_texts<'a, I>(&self, texts: I) -> MergeOutcome
    where
        I: IntoIterator<Item = (usize, &'a str)>,
    {
        let mut outcome = MergeOutcome::default();

        for (index, text) in texts {
            if text.trim().is_empty() {
                continue;
            }

            // First contribution is kept verbatim
            if outcome.text.is_empty() {
                outcome.text.push_str(text);
                continue;
            }

            // Trailing whitespace would shift the tail window
            let kept = outcome.text.trim_end().len();
            outcome.text.truncate(kept);

            let text = text.trim();
            let overlap = self.find_overlap(&outcome.text, text);
            let remainder = if overlap > 0 {
                outcome.overlaps.push((index, overlap));
                skip_chars(text, overlap).trim_start()
            } else {
                text
            };

            if remainder.is_empty() {
                continue;
            }
            outcome.text.push_str(&self.options.boundary);
            outcome.text.push_str(remainder);
        }

        outcome
    }

    /// Length in characters of the longest tail of `merged` that reappears,
    /// modulo whitespace, at the head of `next`. Returns 0 when no candidate
    /// of at least `min_overlap` characters matches.
    pub fn find_overlap(&self, merged: &str, next: &str) -> usize {
        let tail: Vec<char> = merged.chars().rev().take(self.options.max_overlap).collect();
        let head: Vec<char> = next.chars().take(self.options.max_overlap).collect();
        let max_check = tail.len().min(head.len());
        let min_check = self.options.min_overlap.max(1);
        if max_check < min_check {
            return 0;
        }

        for len in (min_check..=max_check).rev() {
            let suffix: String = tail[..len].iter().rev().collect();
            let prefix: String = head[..len].iter().collect();
            if normalize_whitespace(&suffix) == normalize_whitespace(&prefix) {
                return len;
            }
        }
        0
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn skip_chars(text: &str, count: usize) -> &str {
    match text.char_indices().nth(count) {
        Some((byte_offset, _)) => &text[byte_offset..],
        None => "",
    }
}
