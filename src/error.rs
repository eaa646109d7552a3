//! Error types for transcriptor.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscriptorError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Planning errors
    #[error("Invalid chunk plan: {message}")]
    InvalidPlan { message: String },

    // Stage errors
    #[error("Preparation failed: {message}")]
    PreparationFailed { message: String },

    #[error("Transcription of chunk {index} failed: {message}")]
    ChunkTranscriptionFailed { index: usize, message: String },

    #[error("Engine failed to load: {message}")]
    EngineLoad { message: String },

    // External command errors
    #[error("Command not found: {command}")]
    CommandMissing { command: String },

    #[error("Command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {timeout_ms} ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    // Supervision errors
    #[error("Failed to spawn `{command}`: {message}")]
    ProcessSpawn { command: String, message: String },

    #[error("No tracked process for job {job_id}")]
    ProcessNotTracked { job_id: u64 },

    #[error("Process terminated unexpectedly (no heartbeat)")]
    ProcessTerminated,

    // Ledger errors
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: u64 },

    #[error("Ledger write failed: {message}")]
    LedgerWrite { message: String },

    #[error("Invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: u64,
        from: String,
        to: String,
    },

    // Checkpoint / artifact errors
    #[error("Checkpoint error for job {job_id}: {message}")]
    Checkpoint { job_id: u64, message: String },

    #[error("Worker protocol error: {message}")]
    WorkerProtocol { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl TranscriptorError {
    /// Build a `CommandFailed` error, keeping only the tail of a long stderr.
    pub fn from_command_failure(command: String, status: i32, stderr: String) -> Self {
        const MAX_STDERR_CHARS: usize = 2000;
        let stderr = stderr.trim();
        let char_count = stderr.chars().count();
        let stderr = if char_count > MAX_STDERR_CHARS {
            stderr.chars().skip(char_count - MAX_STDERR_CHARS).collect()
        } else {
            stderr.to_string()
        };
        TranscriptorError::CommandFailed {
            command,
            status,
            stderr,
        }
    }

    /// True if this error only means the work was cancelled on request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TranscriptorError::Cancelled)
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, TranscriptorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_preparation_failed_display() {
        let error = TranscriptorError::PreparationFailed {
            message: "ffmpeg exited with 1".to_string(),
        };
        assert_eq!(error.to_string(), "Preparation failed: ffmpeg exited with 1");
    }

    #[test]
    fn test_chunk_transcription_failed_display() {
        let error = TranscriptorError::ChunkTranscriptionFailed {
            index: 3,
            message: "out of memory".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Transcription of chunk 3 failed: out of memory"
        );
    }

    #[test]
    fn test_process_terminated_mentions_heartbeat() {
        let error = TranscriptorError::ProcessTerminated;
        assert!(error.to_string().contains("no heartbeat"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let error = TranscriptorError::InvalidTransition {
            job_id: 7,
            from: "completed".to_string(),
            to: "preparing".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid state transition for job 7: completed -> preparing"
        );
    }

    #[test]
    fn test_command_failure_truncates_stderr() {
        let stderr = "x".repeat(5000);
        let error = TranscriptorError::from_command_failure("ffmpeg".to_string(), 1, stderr);
        match error {
            TranscriptorError::CommandFailed { stderr, status, .. } => {
                assert_eq!(status, 1);
                assert_eq!(stderr.len(), 2000);
            }
            other => panic!("Expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_is_cancelled() {
        assert!(TranscriptorError::Cancelled.is_cancelled());
        assert!(!TranscriptorError::Other("x".to_string()).is_cancelled());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: TranscriptorError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: TranscriptorError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: TranscriptorError = io_error.into();
        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<TranscriptorError>();
        assert_sync::<TranscriptorError>();
    }
}
