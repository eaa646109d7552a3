//! Resumable record of finished chunks.
//!
//! One JSON document per output locator, so a job re-submitted for the same
//! output picks up where the previous attempt stopped. The document also
//! records the plan it belongs to; a checkpoint for a different input or a
//! different window/overlap is ignored.

use crate::chunking::{ChunkDescriptor, ChunkResult};
use crate::error::{Result, TranscriptorError};
use crate::ledger::JobId;
use crate::prepare::PreparedAudio;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Job that last wrote the checkpoint
    pub job_id: JobId,
    pub input: PathBuf,
    pub window_secs: f64,
    pub overlap_secs: f64,
    pub total_chunks: usize,
    pub updated_at: DateTime<Utc>,
    /// Successful results keyed by chunk key (`chunk_001`)
    pub chunks: BTreeMap<String, ChunkResult>,
}

impl Checkpoint {
    pub fn new(job_id: JobId, input: &Path, prepared: &PreparedAudio) -> Self {
        Self {
            job_id,
            input: input.to_path_buf(),
            window_secs: prepared.window_secs,
            overlap_secs: prepared.overlap_secs,
            total_chunks: prepared.chunks.len(),
            updated_at: Utc::now(),
            chunks: BTreeMap::new(),
        }
    }

    /// True if this checkpoint was written for the same input and plan.
    pub fn matches(&self, input: &Path, prepared: &PreparedAudio) -> bool {
        self.input == input
            && self.window_secs == prepared.window_secs
            && self.overlap_secs == prepared.overlap_secs
            && self.total_chunks == prepared.chunks.len()
    }

    /// Store a result. Failed results are not kept so they are retried.
    pub fn record(&mut self, result: &ChunkResult) {
        if result.success {
            self.chunks
                .insert(crate::chunking::chunk_key(result.index), result.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Stored results for planned chunks, in index order.
    pub fn reusable(&self, chunks: &[ChunkDescriptor]) -> Vec<ChunkResult> {
        chunks
            .iter()
            .filter_map(|chunk| {
                self.chunks
                    .get(&chunk.key())
                    .filter(|stored| stored.index == chunk.index && stored.success)
                    .cloned()
            })
            .collect()
    }
}

/// Directory of checkpoint documents.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `/data/out/talk.txt` → `<dir>/data_out_talk.txt.checkpoint.json`
    pub fn path_for(&self, output: &Path) -> PathBuf {
        let flat: String = output
            .to_string_lossy()
            .trim_start_matches('/')
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{flat}.checkpoint.json"))
    }

    pub fn load(&self, output: &Path) -> Result<Option<Checkpoint>> {
        let path = self.path_for(output);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| TranscriptorError::Checkpoint {
                    job_id: 0,
                    message: format!("unreadable checkpoint {}: {e}", path.display()),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the checkpoint for `output`.
    pub fn save(&self, output: &Path, checkpoint: &Checkpoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let checkpoint_error = |message: String| TranscriptorError::Checkpoint {
            job_id: checkpoint.job_id,
            message,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, checkpoint)?;
        tmp.write_all(b"\n")?;
        tmp.persist(self.path_for(output))
            .map_err(|e| checkpoint_error(e.error.to_string()))?;
        tracing::debug!(job_id = checkpoint.job_id, chunks = checkpoint.len(), "checkpoint saved");
        Ok(())
    }

    /// Delete the checkpoint for `output`. Returns false if there was none.
    pub fn remove(&self, output: &Path) -> Result<bool> {
        match std::fs::remove_file(self.path_for(output)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkPlanner;

    fn prepared(duration: f64) -> PreparedAudio {
        let planner = ChunkPlanner::new(20.0, 3.0).unwrap();
        PreparedAudio {
            duration,
            window_secs: 20.0,
            overlap_secs: 3.0,
            chunks: planner.plan_in(duration, Path::new("/w/chunks"), "wav"),
        }
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let output = Path::new("/data/out/talk.txt");
        let audio = prepared(63.0);

        assert!(store.load(output).unwrap().is_none());

        let mut checkpoint = Checkpoint::new(4, Path::new("/in/talk.mp3"), &audio);
        checkpoint.record(&ChunkResult::success(&audio.chunks[0], "first".into(), Vec::new()));
        checkpoint.record(&ChunkResult::failure(&audio.chunks[1], "engine crashed"));
        checkpoint.record(&ChunkResult::success(&audio.chunks[2], "third".into(), Vec::new()));
        store.save(output, &checkpoint).unwrap();

        let loaded = store.load(output).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.chunks.contains_key("chunk_001"));
        assert!(loaded.chunks.contains_key("chunk_003"));
        assert!(loaded.matches(Path::new("/in/talk.mp3"), &audio));

        let reused: Vec<usize> = loaded.reusable(&audio.chunks).iter().map(|r| r.index).collect();
        assert_eq!(reused, vec![0, 2]);

        assert!(store.remove(output).unwrap());
        assert!(!store.remove(output).unwrap());
    }

    #[test]
    fn test_plan_mismatch() {
        let checkpoint = Checkpoint::new(1, Path::new("/in/a.wav"), &prepared(63.0));
        assert!(!checkpoint.matches(Path::new("/in/b.wav"), &prepared(63.0)));
        assert!(!checkpoint.matches(Path::new("/in/a.wav"), &prepared(90.0)));
    }

    #[test]
    fn test_path_for_flattens_directories() {
        let store = CheckpointStore::new("/state");
        assert_eq!(
            store.path_for(Path::new("/data/out/talk.txt")),
            PathBuf::from("/state/data_out_talk.txt.checkpoint.json")
        );
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let output = Path::new("out.txt");
        std::fs::write(store.path_for(output), "{broken").unwrap();
        assert!(matches!(
            store.load(output).unwrap_err(),
            TranscriptorError::Checkpoint { .. }
        ));
    }
}
