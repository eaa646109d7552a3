//! Durable job ledger.
//!
//! The ledger is the source of truth for job rows. The supervisor and the
//! orchestrator push state into it; nothing in the crate asks the ledger which
//! process currently owns a job.

pub mod file;
pub mod memory;

pub use file::FileLedger;
pub use memory::MemoryLedger;

use crate::error::{Result, TranscriptorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub type JobId = u64;

/// Ledger status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TranscriptorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(TranscriptorError::Other(format!("unknown job status: {other}"))),
        }
    }
}

/// Per-job engine and pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub model: String,
    pub language: String,
    pub processes: usize,
    pub threads_per_process: usize,
    pub window_secs: f64,
    pub overlap_secs: f64,
}

impl JobSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            model: config.engine.model.clone(),
            language: config.engine.language.clone(),
            processes: config.pool.processes,
            threads_per_process: config.pool.threads_per_process,
            window_secs: config.chunking.window_secs,
            overlap_secs: config.chunking.overlap_secs,
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input: PathBuf,
    /// Artifact path without extension
    pub output: PathBuf,
    pub settings: JobSettings,
    pub status: JobStatus,
    pub progress: f32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Job {
    /// True when the job is "processing" and its heartbeat is missing or
    /// older than `timeout` at `now`.
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        match self.heartbeat_at {
            None => true,
            Some(at) => (now - at).to_std().is_ok_and(|age| age > timeout),
        }
    }
}

/// Fields needed to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub settings: JobSettings,
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }
}

/// Selection for [`Ledger::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Keep only the most recent `limit` jobs
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
    }
}

/// Persistent job store.
///
/// Every write targets one row; implementations must be safe to call from
/// the heartbeat loop, reader threads and the orchestrator concurrently.
pub trait Ledger: Send + Sync {
    fn create(&self, job: NewJob) -> Result<JobId>;

    /// Apply a partial update and return the updated row.
    fn update(&self, id: JobId, update: JobUpdate) -> Result<Job>;

    fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Matching jobs in ascending id order.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Refresh the job's heartbeat timestamp.
    fn heartbeat(&self, id: JobId) -> Result<()>;

    /// Remove a row. Returns false if it did not exist.
    fn delete(&self, id: JobId) -> Result<bool>;

    /// "processing" jobs whose heartbeat is missing or older than `timeout`.
    fn stale_processing(&self, timeout: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        Ok(self
            .list(&JobFilter::with_status(JobStatus::Processing))?
            .into_iter()
            .filter(|job| job.is_stale(timeout, now))
            .collect())
    }
}

/// Apply `update` to `job` at time `now`.
///
/// Leaving a terminal state is rejected; repeating it is allowed.
pub(crate) fn apply_update(job: &mut Job, update: JobUpdate, now: DateTime<Utc>) -> Result<()> {
    if let Some(next) = update.status
        && job.status.is_terminal()
        && next != job.status
    {
        return Err(TranscriptorError::InvalidTransition {
            job_id: job.id,
            from: job.status.to_string(),
            to: next.to_string(),
        });
    }

    if let Some(progress) = update.progress {
        job.progress = progress.clamp(0.0, 100.0);
    }
    if let Some(pid) = update.pid {
        job.pid = Some(pid);
    }
    if let Some(error) = update.error {
        job.error = Some(error);
    }
    if let Some(log_file) = update.log_file {
        job.log_file = Some(log_file);
    }

    if let Some(status) = update.status {
        job.status = status;
        match status {
            JobStatus::Processing => {
                job.started_at.get_or_insert(now);
                job.heartbeat_at = Some(now);
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                job.pid = None;
                job.completed_at.get_or_insert(now);
                if status == JobStatus::Completed {
                    job.progress = 100.0;
                }
            }
            JobStatus::Pending => {}
        }
    }
    Ok(())
}

pub(crate) fn new_row(id: JobId, job: NewJob, now: DateTime<Utc>) -> Job {
    Job {
        id,
        input: job.input,
        output: job.output,
        settings: job.settings,
        status: JobStatus::Pending,
        progress: 0.0,
        created_at: now,
        started_at: None,
        completed_at: None,
        pid: None,
        heartbeat_at: None,
        error: None,
        log_file: None,
    }
}

/// Apply `filter` to rows already sorted by ascending id.
pub(crate) fn select(rows: impl Iterator<Item = Job>, filter: &JobFilter) -> Vec<Job> {
    let mut jobs: Vec<Job> = rows.filter(|job| filter.matches(job)).collect();
    if let Some(limit) = filter.limit
        && jobs.len() > limit
    {
        jobs.drain(..jobs.len() - limit);
    }
    jobs
}

/// Aggregate counts over a set of jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed jobs as a percentage of finished (terminal) jobs
    pub success_rate: f64,
}

impl LedgerStats {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut stats = LedgerStats {
            total: jobs.len(),
            ..LedgerStats::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        let finished = stats.completed + stats.failed + stats.cancelled;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64 * 100.0;
        }
        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_job(name: &str) -> NewJob {
        NewJob {
            input: PathBuf::from(format!("/audio/{name}.wav")),
            output: PathBuf::from(format!("/out/{name}")),
            settings: JobSettings::from_config(&crate::config::Config::default()),
        }
    }

    fn row() -> Job {
        new_row(1, sample_job("a"), Utc::now())
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_processing_sets_started_and_heartbeat() {
        let mut job = row();
        let now = Utc::now();
        apply_update(&mut job, JobUpdate::status(JobStatus::Processing).with_pid(42), now).unwrap();
        assert_eq!(job.pid, Some(42));
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.heartbeat_at, Some(now));
    }

    #[test]
    fn test_terminal_status_clears_pid() {
        let mut job = row();
        let now = Utc::now();
        apply_update(&mut job, JobUpdate::status(JobStatus::Processing).with_pid(42), now).unwrap();
        apply_update(&mut job, JobUpdate::status(JobStatus::Completed), now).unwrap();
        assert_eq!(job.pid, None);
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.progress, 100.0);
    }

    #[test]
    fn test_leaving_terminal_state_rejected() {
        let mut job = row();
        let now = Utc::now();
        apply_update(&mut job, JobUpdate::status(JobStatus::Cancelled), now).unwrap();
        let err = apply_update(&mut job, JobUpdate::status(JobStatus::Completed), now).unwrap_err();
        assert!(matches!(err, TranscriptorError::InvalidTransition { .. }));
        // Repeating the same terminal state is fine
        apply_update(&mut job, JobUpdate::status(JobStatus::Cancelled), now).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut job = row();
        apply_update(&mut job, JobUpdate::progress(140.0), Utc::now()).unwrap();
        assert_eq!(job.progress, 100.0);
    }

    #[test]
    fn test_is_stale() {
        let mut job = row();
        let now = Utc::now();
        assert!(!job.is_stale(Duration::from_secs(60), now));

        job.status = JobStatus::Processing;
        assert!(job.is_stale(Duration::from_secs(60), now));

        job.heartbeat_at = Some(now - chrono::Duration::seconds(30));
        assert!(!job.is_stale(Duration::from_secs(60), now));

        job.heartbeat_at = Some(now - chrono::Duration::seconds(90));
        assert!(job.is_stale(Duration::from_secs(60), now));
    }

    #[test]
    fn test_select_keeps_most_recent() {
        let now = Utc::now();
        let rows = (1..=5).map(|id| new_row(id, sample_job("x"), now));
        let filter = JobFilter {
            status: None,
            limit: Some(2),
        };
        let ids: Vec<JobId> = select(rows, &filter).iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn test_stats() {
        let now = Utc::now();
        let mut jobs: Vec<Job> = (1..=4).map(|id| new_row(id, sample_job("x"), now)).collect();
        jobs[0].status = JobStatus::Completed;
        jobs[1].status = JobStatus::Completed;
        jobs[2].status = JobStatus::Failed;
        let stats = LedgerStats::from_jobs(&jobs);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 1);
        assert!((stats.success_rate - 66.666).abs() < 0.01);
    }
}
