//! Job pipeline: preparation, transcription, checkpointing and artifacts.

pub mod artifacts;
pub mod checkpoint;
pub mod events;
pub mod orchestrator;
pub mod state;

pub use artifacts::{ArtifactPaths, TranscriptSummary, write_artifacts};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use events::{EventSink, PipelineEvent};
pub use orchestrator::{JobOutcome, PipelineJob, PipelineOrchestrator, PipelineSettings};
pub use state::{JobStage, StageTracker};
