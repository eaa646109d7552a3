//! Transcript artifacts: `.txt`, `.json` and `.srt` next to the output locator.

use crate::chunking::{ChunkResult, build_srt};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Summary metadata of a finished transcription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSummary {
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    /// Successful chunks over all planned chunks, in percent
    pub success_rate: f64,
    pub reused_from_checkpoint: usize,
    /// Chunks sent to the engine in this run
    pub engine_invocations: usize,
    /// Success rate over the chunks transcribed in this run; `None` when
    /// everything came from the checkpoint
    pub run_success_rate: Option<f64>,
    pub model: String,
    pub language: String,
    /// `PxT`
    pub architecture: String,
    pub processing_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptSummary {
    /// Count outcomes of sorted `results`, `reused` of which came from a
    /// checkpoint.
    pub fn from_results(
        results: &[ChunkResult],
        total_chunks: usize,
        reused: usize,
        model: &str,
        language: &str,
        architecture: String,
        processing_seconds: f64,
    ) -> Self {
        let successful_chunks = results.iter().filter(|r| r.success).count();
        let engine_invocations = results.len().saturating_sub(reused);
        let run_successes = successful_chunks.saturating_sub(reused);
        Self {
            total_chunks,
            successful_chunks,
            failed_chunks: total_chunks.saturating_sub(successful_chunks),
            success_rate: percent(successful_chunks, total_chunks),
            reused_from_checkpoint: reused,
            engine_invocations,
            run_success_rate: (engine_invocations > 0)
                .then(|| percent(run_successes, engine_invocations)),
            model: model.to_string(),
            language: language.to_string(),
            architecture,
            processing_seconds,
            timestamp: Utc::now(),
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[derive(Debug, Serialize)]
struct TranscriptDocument<'a> {
    transcription: &'a str,
    chunks: &'a [ChunkResult],
    metadata: &'a TranscriptSummary,
}

/// Where the artifacts of one output locator live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    pub text: PathBuf,
    pub json: PathBuf,
    pub srt: PathBuf,
}

impl ArtifactPaths {
    /// `out/talk` or `out/talk.txt` → `out/talk.{txt,json,srt}`
    pub fn for_output(output: &Path) -> Self {
        Self {
            text: output.with_extension("txt"),
            json: output.with_extension("json"),
            srt: output.with_extension("srt"),
        }
    }
}

/// Write all three artifacts for sorted `results`.
pub fn write_artifacts(
    output: &Path,
    text: &str,
    results: &[ChunkResult],
    summary: &TranscriptSummary,
) -> Result<ArtifactPaths> {
    let paths = ArtifactPaths::for_output(output);
    if let Some(parent) = paths.text.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&paths.text, text)?;

    let document = TranscriptDocument {
        transcription: text,
        chunks: results,
        metadata: summary,
    };
    std::fs::write(&paths.json, serde_json::to_vec_pretty(&document)?)?;

    std::fs::write(&paths.srt, build_srt(results))?;

    tracing::info!(text = %paths.text.display(), json = %paths.json.display(), srt = %paths.srt.display(), "artifacts written");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{ChunkPlanner, TimedSegment};

    fn results() -> Vec<ChunkResult> {
        let chunks = ChunkPlanner::new(20.0, 3.0).unwrap().plan(45.0);
        vec![
            ChunkResult::success(
                &chunks[0],
                "hello".into(),
                vec![TimedSegment { start: 0.0, end: 2.0, text: "hello".into() }],
            ),
            ChunkResult::failure(&chunks[1], "engine crashed"),
            ChunkResult::success(
                &chunks[2],
                "bye".into(),
                vec![TimedSegment { start: 1.0, end: 2.5, text: "bye".into() }],
            ),
        ]
    }

    #[test]
    fn test_summary_counts() {
        let summary = TranscriptSummary::from_results(&results(), 3, 1, "medium", "th", "2x8".into(), 4.5);
        assert_eq!(summary.successful_chunks, 2);
        assert_eq!(summary.failed_chunks, 1);
        assert!((summary.success_rate - 66.666).abs() < 0.01);
        assert_eq!(summary.engine_invocations, 2);
        assert_eq!(summary.run_success_rate, Some(50.0));
    }

    #[test]
    fn test_summary_all_reused() {
        let all = results();
        let summary = TranscriptSummary::from_results(&all[..1], 1, 1, "m", "auto", "1x1".into(), 0.0);
        assert_eq!(summary.engine_invocations, 0);
        assert_eq!(summary.run_success_rate, None);
        assert_eq!(summary.success_rate, 100.0);
    }

    #[test]
    fn test_paths_replace_extension() {
        let paths = ArtifactPaths::for_output(Path::new("out/talk.txt"));
        assert_eq!(paths.json, PathBuf::from("out/talk.json"));
        let paths = ArtifactPaths::for_output(Path::new("out/talk"));
        assert_eq!(paths.text, PathBuf::from("out/talk.txt"));
        assert_eq!(paths.srt, PathBuf::from("out/talk.srt"));
    }

    #[test]
    fn test_write_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let results = results();
        let summary = TranscriptSummary::from_results(&results, 3, 0, "medium", "th", "2x8".into(), 1.0);
        let paths = write_artifacts(&dir.path().join("nested/talk"), "hello\n\nbye", &results, &summary).unwrap();

        assert_eq!(std::fs::read_to_string(&paths.text).unwrap(), "hello\n\nbye");

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.json).unwrap()).unwrap();
        assert_eq!(json["transcription"], "hello\n\nbye");
        assert_eq!(json["chunks"].as_array().unwrap().len(), 3);
        assert_eq!(json["metadata"]["architecture"], "2x8");
        assert_eq!(json["metadata"]["failed_chunks"], 1);

        let srt = std::fs::read_to_string(&paths.srt).unwrap();
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:02,000\nhello\n"));
        // Third chunk is padded from 37s
        assert!(srt.contains("2\n00:00:38,000 --> 00:00:39,500\nbye\n"));
    }
}
