//! Progress events emitted by the orchestrator.

use crate::ledger::JobId;
use crate::pipeline::artifacts::TranscriptSummary;
use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Preparing {
        job_id: JobId,
    },
    Prepared {
        job_id: JobId,
        chunks: usize,
        duration: f64,
    },
    Transcribing {
        job_id: JobId,
        chunks: usize,
        reused: usize,
    },
    ChunkDone {
        job_id: JobId,
        index: usize,
        success: bool,
        completed: usize,
        total: usize,
    },
    CheckpointSaved {
        job_id: JobId,
        chunks: usize,
    },
    Completed {
        job_id: JobId,
        summary: TranscriptSummary,
    },
    Failed {
        job_id: JobId,
        error: String,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl PipelineEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            PipelineEvent::Preparing { job_id }
            | PipelineEvent::Prepared { job_id, .. }
            | PipelineEvent::Transcribing { job_id, .. }
            | PipelineEvent::ChunkDone { job_id, .. }
            | PipelineEvent::CheckpointSaved { job_id, .. }
            | PipelineEvent::Completed { job_id, .. }
            | PipelineEvent::Failed { job_id, .. }
            | PipelineEvent::Cancelled { job_id } => *job_id,
        }
    }
}

/// One-line human rendering. Chunk progress lines carry a percentage so a
/// supervising process can parse it.
impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Preparing { job_id } => write!(f, "[job {job_id}] preparing"),
            PipelineEvent::Prepared {
                job_id,
                chunks,
                duration,
            } => write!(f, "[job {job_id}] prepared {chunks} chunks from {duration:.1}s of audio"),
            PipelineEvent::Transcribing {
                job_id,
                chunks,
                reused,
            } => write!(f, "[job {job_id}] transcribing {chunks} chunks ({reused} from checkpoint)"),
            PipelineEvent::ChunkDone {
                job_id,
                index,
                success,
                completed,
                total,
            } => write!(
                f,
                "[job {job_id}] chunk {} {}: {completed}/{total} ({:.1}%)",
                index + 1,
                if *success { "done" } else { "failed" },
                *completed as f64 * 100.0 / (*total).max(1) as f64
            ),
            PipelineEvent::CheckpointSaved { job_id, chunks } => {
                write!(f, "[job {job_id}] checkpoint saved ({chunks} chunks)")
            }
            PipelineEvent::Completed { job_id, summary } => write!(
                f,
                "[job {job_id}] completed: {}/{} chunks, {:.1}% success in {:.1}s",
                summary.successful_chunks,
                summary.total_chunks,
                summary.success_rate,
                summary.processing_seconds
            ),
            PipelineEvent::Failed { job_id, error } => write!(f, "[job {job_id}] failed: {error}"),
            PipelineEvent::Cancelled { job_id } => write!(f, "[job {job_id}] cancelled"),
        }
    }
}

/// Non-blocking event publisher; a full or closed channel drops events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    tracing::debug!(job_id = event.job_id(), "event channel full, dropping event");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}
