//! Window planning, per-chunk results and transcript reassembly.

pub mod merger;
pub mod planner;
pub mod result;
pub mod subtitle;

pub use merger::{MergeOptions, MergeOutcome, ResultMerger};
pub use planner::{ChunkDescriptor, ChunkPlanner, MergeInfo, OverlapRegion, chunk_key, merge_info};
pub use result::{ChunkResult, TimedSegment, missing_indices, sort_results};
pub use subtitle::{SubtitleCue, build_srt, format_srt_time};
