//! Preparation stage: probe, optionally enhance, and cut the input into
//! overlapping chunk files.

pub mod ffmpeg;

pub use ffmpeg::FfmpegPreparer;

use crate::cancel::CancelToken;
use crate::chunking::{ChunkDescriptor, ChunkPlanner};
use crate::error::{Result, TranscriptorError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// File written next to the chunks describing the plan.
pub const METADATA_FILE: &str = "chunking_metadata.json";

/// Output of the preparation stage for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedAudio {
    /// Total duration of the input in seconds
    pub duration: f64,
    pub window_secs: f64,
    pub overlap_secs: f64,
    pub chunks: Vec<ChunkDescriptor>,
}

impl PreparedAudio {
    /// Write the chunk metadata document into `dir`.
    pub fn write_metadata(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(METADATA_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}

/// The CPU-bound stage turning an input file into chunk files.
pub trait Preparer: Send + Sync {
    /// Prepare `input`, writing chunk files under `work_dir`.
    ///
    /// Must return `Cancelled` promptly once `cancel` fires.
    fn prepare(&self, input: &Path, work_dir: &Path, cancel: &CancelToken) -> Result<PreparedAudio>;
}

/// Preparer for tests: plans chunks from a configured duration without
/// touching any audio.
#[derive(Debug, Clone)]
pub struct MockPreparer {
    planner: ChunkPlanner,
    default_duration: f64,
    durations: HashMap<String, f64>,
    failing: HashSet<String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockPreparer {
    pub fn new(planner: ChunkPlanner, default_duration: f64) -> Self {
        Self {
            planner,
            default_duration,
            durations: HashMap::new(),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Duration reported for inputs with this file name
    pub fn with_duration(mut self, file_name: &str, duration: f64) -> Self {
        self.durations.insert(file_name.to_string(), duration);
        self
    }

    /// Fail preparation of inputs with this file name
    pub fn with_failing_input(mut self, file_name: &str) -> Self {
        self.failing.insert(file_name.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Preparer for MockPreparer {
    fn prepare(&self, input: &Path, work_dir: &Path, cancel: &CancelToken) -> Result<PreparedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let deadline = std::time::Instant::now() + self.delay;
        while std::time::Instant::now() < deadline {
            cancel.checkpoint()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        cancel.checkpoint()?;

        if self.failing.contains(&name) {
            return Err(TranscriptorError::PreparationFailed {
                message: format!("mock preparation failure for {name}"),
            });
        }
        let duration = self
            .durations
            .get(&name)
            .copied()
            .unwrap_or(self.default_duration);
        if duration <= 0.0 {
            return Err(TranscriptorError::PreparationFailed {
                message: format!("{name} has no audio"),
            });
        }

        Ok(PreparedAudio {
            duration,
            window_secs: self.planner.window_secs(),
            overlap_secs: self.planner.overlap_secs(),
            chunks: self.planner.plan_in(duration, work_dir, "wav"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_preparer_plans_configured_duration() {
        let planner = ChunkPlanner::new(20.0, 3.0).unwrap();
        let preparer = MockPreparer::new(planner, 63.0).with_duration("short.wav", 10.0);
        let cancel = CancelToken::new();

        let long = preparer
            .prepare(Path::new("/in/long.mp3"), Path::new("/work"), &cancel)
            .unwrap();
        assert_eq!(long.chunks.len(), 4);
        assert_eq!(long.chunks[0].file, PathBuf::from("/work/chunk_001.wav"));

        let short = preparer
            .prepare(Path::new("/in/short.wav"), Path::new("/work"), &cancel)
            .unwrap();
        assert_eq!(short.chunks.len(), 1);
        assert_eq!(preparer.call_count(), 2);
    }

    #[test]
    fn test_mock_preparer_failure() {
        let planner = ChunkPlanner::new(20.0, 3.0).unwrap();
        let preparer = MockPreparer::new(planner, 63.0).with_failing_input("bad.wav");
        let err = preparer
            .prepare(Path::new("bad.wav"), Path::new("/work"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TranscriptorError::PreparationFailed { .. }));
    }

    #[test]
    fn test_mock_preparer_honours_cancel() {
        let planner = ChunkPlanner::new(20.0, 3.0).unwrap();
        let preparer = MockPreparer::new(planner, 63.0).with_delay(Duration::from_secs(30));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = preparer
            .prepare(Path::new("a.wav"), Path::new("/work"), &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_write_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let planner = ChunkPlanner::new(20.0, 3.0).unwrap();
        let prepared = PreparedAudio {
            duration: 45.0,
            window_secs: 20.0,
            overlap_secs: 3.0,
            chunks: planner.plan_in(45.0, dir.path(), "wav"),
        };
        let path = prepared.write_metadata(dir.path()).unwrap();
        let read: PreparedAudio =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(read, prepared);
    }
}
