//! transcriptor - chunked long-audio transcription
//!
//! Splits long recordings into overlapping windows, transcribes them on a
//! supervised pool of worker processes and threads, and stitches the pieces
//! back into one transcript.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod cancel;
pub mod chunking;
#[cfg(feature = "cli")]
pub mod cli;
pub mod command;
pub mod config;
pub mod daemon;
pub mod defaults;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod prepare;
pub mod supervisor;
pub mod sys;

// Composition root - needs everything
#[cfg(feature = "cli")]
pub mod app;

// Core components
pub use chunking::{ChunkDescriptor, ChunkPlanner, ChunkResult, ResultMerger};
pub use pipeline::{CheckpointStore, PipelineOrchestrator};
pub use pool::WorkerPool;
pub use supervisor::ProcessSupervisor;

// Collaborator traits
pub use engine::{EngineFactory, Transcriber};
pub use ledger::Ledger;
pub use prepare::Preparer;

// Error handling
pub use error::{Result, TranscriptorError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.0+abc1234"` when git hash is available, `"0.3.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn test_version_string_hash_suffix() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            let hash_part = ver.split('+').nth(1).unwrap_or("");
            assert_eq!(hash_part.len(), 7, "Git hash should be 7 chars, got: {}", ver);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
