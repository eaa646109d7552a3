//! Line protocol between the pool and `transcriptor worker` lane processes.
//!
//! The pool writes a [`LaneManifest`] as JSON and starts the worker with its
//! path. The worker prints one `@chunk <json>` line per finished chunk on
//! stdout; every other output line is ordinary log text.

use crate::chunking::{ChunkDescriptor, ChunkResult};
use crate::config::EngineConfig;
use crate::defaults::WORKER_RESULT_PREFIX;
use crate::error::{Result, TranscriptorError};
use crate::ledger::JobId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Work handed to one lane process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneManifest {
    pub job_id: JobId,
    pub lane: usize,
    pub threads: usize,
    pub language: String,
    pub engine: EngineConfig,
    pub chunks: Vec<ChunkDescriptor>,
}

impl LaneManifest {
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| TranscriptorError::WorkerProtocol {
            message: format!("bad manifest {}: {e}", path.display()),
        })
    }
}

/// Render a result as a protocol line (without newline).
pub fn encode_result(result: &ChunkResult) -> Result<String> {
    Ok(format!("{WORKER_RESULT_PREFIX}{}", serde_json::to_string(result)?))
}

/// Parse a worker output line.
///
/// `None` for lines that are not protocol lines.
pub fn decode_line(line: &str) -> Option<Result<ChunkResult>> {
    let payload = line.trim_end().strip_prefix(WORKER_RESULT_PREFIX)?;
    Some(
        serde_json::from_str(payload).map_err(|e| TranscriptorError::WorkerProtocol {
            message: format!("bad result line: {e}"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkPlanner;

    #[test]
    fn test_result_line_is_decodable() {
        let chunk = &ChunkPlanner::new(20.0, 3.0).unwrap().plan(45.0)[1];
        let result = ChunkResult::success(chunk, "hello there".into(), Vec::new());
        let line = encode_result(&result).unwrap();
        assert!(line.starts_with("@chunk {"));
        assert!(!line.contains('\n'));
        assert_eq!(decode_line(&line).unwrap().unwrap(), result);
    }

    #[test]
    fn test_plain_lines_are_ignored() {
        assert!(decode_line("lane 0: 3/10 chunks (30.0%)").is_none());
        assert!(decode_line("").is_none());
    }

    #[test]
    fn test_malformed_result_line() {
        let err = decode_line("@chunk {not json").unwrap().unwrap_err();
        assert!(matches!(err, TranscriptorError::WorkerProtocol { .. }));
    }

    #[test]
    fn test_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lane.json");
        let manifest = LaneManifest {
            job_id: 7,
            lane: 1,
            threads: 4,
            language: "th".into(),
            engine: EngineConfig::default(),
            chunks: ChunkPlanner::new(20.0, 3.0).unwrap().plan(63.0),
        };
        manifest.write(&path).unwrap();
        assert_eq!(LaneManifest::read(&path).unwrap(), manifest);

        std::fs::write(&path, "{}").unwrap();
        assert!(LaneManifest::read(&path).is_err());
    }
}
