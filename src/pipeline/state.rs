//! Per-job stage machine of the orchestrator.
//!
//! ```text
//! pending ─▶ preparing ─▶ transcribing ─▶ completed
//!    │           │              │
//!    │           ├──────────────┴────────▶ failed
//!    └───────────┴──────────────┴────────▶ cancelled
//! ```

use crate::error::{Result, TranscriptorError};
use crate::ledger::{JobId, JobStatus};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Pending,
    Preparing,
    Transcribing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStage::Completed | JobStage::Failed | JobStage::Cancelled
        )
    }

    pub fn can_transition(self, to: JobStage) -> bool {
        use JobStage::*;
        matches!(
            (self, to),
            (Pending, Preparing)
                | (Preparing, Transcribing)
                | (Transcribing, Completed)
                | (Preparing | Transcribing, Failed)
                | (Pending | Preparing | Transcribing, Cancelled)
        )
    }

    /// Ledger status for this stage.
    pub fn ledger_status(self) -> JobStatus {
        match self {
            JobStage::Pending => JobStatus::Pending,
            JobStage::Preparing | JobStage::Transcribing => JobStatus::Processing,
            JobStage::Completed => JobStatus::Completed,
            JobStage::Failed => JobStatus::Failed,
            JobStage::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Preparing => "preparing",
            JobStage::Transcribing => "transcribing",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current stage of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTracker {
    job_id: JobId,
    stage: JobStage,
}

impl StageTracker {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            stage: JobStage::Pending,
        }
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    pub fn advance(&mut self, to: JobStage) -> Result<()> {
        if !self.stage.can_transition(to) {
            return Err(TranscriptorError::InvalidTransition {
                job_id: self.job_id,
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(job_id = self.job_id, from = %self.stage, to = %to, "stage change");
        self.stage = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = StageTracker::new(1);
        tracker.advance(JobStage::Preparing).unwrap();
        tracker.advance(JobStage::Transcribing).unwrap();
        tracker.advance(JobStage::Completed).unwrap();
        assert!(tracker.stage().is_terminal());
    }

    #[test]
    fn test_cancel_allowed_from_every_live_stage() {
        for path in [
            &[][..],
            &[JobStage::Preparing][..],
            &[JobStage::Preparing, JobStage::Transcribing][..],
        ] {
            let mut tracker = StageTracker::new(1);
            for &stage in path {
                tracker.advance(stage).unwrap();
            }
            tracker.advance(JobStage::Cancelled).unwrap();
        }
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!JobStage::Pending.can_transition(JobStage::Transcribing));
        assert!(!JobStage::Pending.can_transition(JobStage::Failed));
        assert!(!JobStage::Preparing.can_transition(JobStage::Completed));
        assert!(!JobStage::Completed.can_transition(JobStage::Failed));
        assert!(!JobStage::Cancelled.can_transition(JobStage::Preparing));

        let mut tracker = StageTracker::new(9);
        let err = tracker.advance(JobStage::Completed).unwrap_err();
        assert!(matches!(err, TranscriptorError::InvalidTransition { job_id: 9, .. }));
        assert_eq!(tracker.stage(), JobStage::Pending);
    }

    #[test]
    fn test_ledger_status_mapping() {
        assert_eq!(JobStage::Preparing.ledger_status(), JobStatus::Processing);
        assert_eq!(JobStage::Transcribing.ledger_status(), JobStatus::Processing);
        assert_eq!(JobStage::Cancelled.ledger_status(), JobStatus::Cancelled);
    }
}
