//! Batch scheduler overlapping preparation and transcription.
//!
//! ```text
//! jobs ─▶ queue ─▶ preparation threads (max_parallel_preparation)
//!                        │  (completion order)
//!                        ▼
//!                 prepared channel ─▶ transcription (one job at a time)
//!                                        │ WorkerPool ─▶ results
//!                                        │ checkpoint every K
//!                                        ▼
//!                                 sort ─▶ merge ─▶ artifacts ─▶ ledger
//! ```

use crate::cancel::CancelToken;
use crate::chunking::{
    ChunkDescriptor, ChunkResult, MergeOptions, ResultMerger, missing_indices, sort_results,
};
use crate::config::Config;
use crate::defaults;
use crate::error::TranscriptorError;
use crate::ledger::{Job, JobId, JobStatus, JobUpdate, Ledger};
use crate::pipeline::artifacts::{ArtifactPaths, TranscriptSummary, write_artifacts};
use crate::pipeline::checkpoint::{Checkpoint, CheckpointStore};
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline::state::{JobStage, StageTracker};
use crate::pool::WorkerPool;
use crate::prepare::{PreparedAudio, Preparer};
use crate::supervisor::{LocalLease, ProcessSupervisor, ProgressTracker};
use crate::sys::current_pid;
use crossbeam_channel::{Sender, bounded};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Orchestrator knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub max_parallel_preparation: usize,
    /// Save the checkpoint after this many new results
    pub checkpoint_every: usize,
    pub work_dir: PathBuf,
    pub keep_work_dir: bool,
    pub merge: MergeOptions,
    /// Graceful wait when stopping a cancelled job's processes
    pub graceful_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_parallel_preparation: config.pipeline.max_parallel_preparation,
            checkpoint_every: config.pipeline.checkpoint_every,
            work_dir: config.work_dir(),
            keep_work_dir: config.pipeline.keep_work_dir,
            merge: MergeOptions::from(&config.merge),
            graceful_timeout: config.supervisor.graceful_timeout(),
        }
    }
}

/// A ledger job as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineJob {
    pub id: JobId,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl From<&Job> for PipelineJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            input: job.input.clone(),
            output: job.output.clone(),
        }
    }
}

/// Final state of one job of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub input: PathBuf,
    pub stage: JobStage,
    pub summary: Option<TranscriptSummary>,
    pub artifacts: Option<ArtifactPaths>,
    pub error: Option<String>,
    /// Set when the terminal ledger write failed
    pub ledger_error: Option<String>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.stage == JobStage::Completed && self.ledger_error.is_none()
    }
}

/// A job between stages. Holding the lease keeps it heartbeated.
struct ActiveJob {
    job: PipelineJob,
    stage: StageTracker,
    started: Instant,
    work_dir: PathBuf,
    _lease: LocalLease,
}

enum Prepared {
    Ready(ActiveJob, PreparedAudio),
    Finished(JobOutcome),
}

/// What a finished job produced.
#[derive(Default)]
struct Conclusion {
    error: Option<String>,
    summary: Option<TranscriptSummary>,
    artifacts: Option<ArtifactPaths>,
}

impl Conclusion {
    fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

pub struct PipelineOrchestrator {
    ledger: Arc<dyn Ledger>,
    supervisor: ProcessSupervisor,
    preparer: Arc<dyn Preparer>,
    pool: WorkerPool,
    checkpoints: CheckpointStore,
    merger: ResultMerger,
    settings: PipelineSettings,
    events: EventSink,
    cancel: CancelToken,
}

impl PipelineOrchestrator {
    pub fn new(
        supervisor: ProcessSupervisor,
        preparer: Arc<dyn Preparer>,
        pool: WorkerPool,
        checkpoints: CheckpointStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger: supervisor.ledger(),
            supervisor,
            preparer,
            pool,
            checkpoints,
            merger: ResultMerger::new(settings.merge.clone()),
            settings,
            events: EventSink::none(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_events(mut self, tx: Sender<PipelineEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run one job through both stages.
    pub fn run_job(&self, job: PipelineJob) -> JobOutcome {
        let id = job.id;
        let input = job.input.clone();
        self.run_batch(vec![job])
            .pop()
            .unwrap_or_else(|| JobOutcome {
                job_id: id,
                input,
                stage: JobStage::Failed,
                summary: None,
                artifacts: None,
                error: Some("job produced no outcome".to_string()),
                ledger_error: None,
            })
    }

    /// Run a batch; outcomes come back in transcription order, which is
    /// preparation completion order.
    ///
    /// Ledger rows for every job must already exist. One job failing never
    /// stops the others.
    pub fn run_batch(&self, jobs: Vec<PipelineJob>) -> Vec<JobOutcome> {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.settings.max_parallel_preparation.clamp(1, total);
        tracing::info!(jobs = total, preparation_workers = workers, "batch started");

        let (queue_tx, queue_rx) = bounded::<PipelineJob>(total);
        for job in jobs {
            // Capacity equals the batch size
            if queue_tx.send(job).is_err() {
                break;
            }
        }
        drop(queue_tx);

        let (prepared_tx, prepared_rx) = bounded::<Prepared>(total);
        let mut outcomes = Vec::with_capacity(total);

        thread::scope(|scope| {
            for _ in 0..workers {
                let queue_rx = queue_rx.clone();
                let prepared_tx = prepared_tx.clone();
                scope.spawn(move || {
                    while let Ok(job) = queue_rx.recv() {
                        if prepared_tx.send(self.prepare(job)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(prepared_tx);

            // Single consumer: one job holds the pool at a time
            for prepared in prepared_rx.iter() {
                let outcome = match prepared {
                    Prepared::Ready(active, audio) => self.transcribe(active, audio),
                    Prepared::Finished(outcome) => outcome,
                };
                outcomes.push(outcome);
            }
        });

        let completed = outcomes.iter().filter(|o| o.is_success()).count();
        tracing::info!(jobs = total, completed, "batch finished");
        outcomes
    }

    fn prepare(&self, job: PipelineJob) -> Prepared {
        let lease = self.supervisor.register_local(job.id);
        let mut active = ActiveJob {
            stage: StageTracker::new(job.id),
            started: Instant::now(),
            work_dir: self.settings.work_dir.join(format!("job_{}", job.id)),
            job,
            _lease: lease,
        };
        let id = active.job.id;

        if self.cancel.is_cancelled() {
            return Prepared::Finished(self.conclude(active, JobStage::Cancelled, Conclusion::default()));
        }
        self.advance(&mut active, JobStage::Preparing);
        self.events.emit(PipelineEvent::Preparing { job_id: id });
        self.note(
            id,
            JobUpdate::status(JobStatus::Processing).with_pid(current_pid()),
        );
        tracing::info!(job_id = id, input = %active.job.input.display(), "preparing");

        if let Err(e) = std::fs::create_dir_all(&active.work_dir) {
            let message = format!("cannot create work dir {}: {e}", active.work_dir.display());
            return Prepared::Finished(self.conclude(active, JobStage::Failed, Conclusion::error(message)));
        }

        match self
            .preparer
            .prepare(&active.job.input, &active.work_dir, &self.cancel)
        {
            Ok(audio) => {
                tracing::info!(job_id = id, chunks = audio.chunks.len(), duration = audio.duration, "prepared");
                self.events.emit(PipelineEvent::Prepared {
                    job_id: id,
                    chunks: audio.chunks.len(),
                    duration: audio.duration,
                });
                Prepared::Ready(active, audio)
            }
            Err(e) if e.is_cancelled() => {
                Prepared::Finished(self.conclude(active, JobStage::Cancelled, Conclusion::default()))
            }
            Err(e) => {
                tracing::error!(job_id = id, error = %e, "preparation failed");
                Prepared::Finished(self.conclude(active, JobStage::Failed, Conclusion::error(e.to_string())))
            }
        }
    }

    fn transcribe(&self, mut active: ActiveJob, audio: PreparedAudio) -> JobOutcome {
        if self.cancel.is_cancelled() {
            return self.conclude(active, JobStage::Cancelled, Conclusion::default());
        }
        self.advance(&mut active, JobStage::Transcribing);
        let id = active.job.id;
        let total = audio.chunks.len();

        let mut checkpoint = self.load_checkpoint(&active.job, &audio);
        let reused = checkpoint.reusable(&audio.chunks);
        let reused_indices: HashSet<usize> = reused.iter().map(|r| r.index).collect();
        let remaining: Vec<ChunkDescriptor> = audio
            .chunks
            .iter()
            .filter(|chunk| !reused_indices.contains(&chunk.index))
            .cloned()
            .collect();
        let reused_count = reused.len();
        self.events.emit(PipelineEvent::Transcribing {
            job_id: id,
            chunks: total,
            reused: reused_count,
        });
        tracing::info!(job_id = id, chunks = total, reused = reused_count, "transcribing");

        let mut results = reused;
        let mut progress = ProgressTracker::new(defaults::PROGRESS_STEP);
        let mut unsaved = 0;
        let capacity = remaining.len().clamp(1, 256);
        let (tx, rx) = bounded::<ChunkResult>(capacity);

        let pool_result = thread::scope(|scope| {
            let handle = scope.spawn(move || self.pool.run(id, &remaining, &self.cancel, &tx));
            for result in rx.iter() {
                checkpoint.record(&result);
                self.events.emit(PipelineEvent::ChunkDone {
                    job_id: id,
                    index: result.index,
                    success: result.success,
                    completed: results.len() + 1,
                    total,
                });
                results.push(result);

                let percent = results.len() as f32 * 100.0 / total.max(1) as f32;
                if let Some(percent) = progress.observe(percent) {
                    self.note(id, JobUpdate::progress(percent));
                }

                unsaved += 1;
                if unsaved >= self.settings.checkpoint_every {
                    self.save_checkpoint(&active.job.output, &mut checkpoint);
                    unsaved = 0;
                }
            }
            handle
                .join()
                .unwrap_or_else(|_| Err(TranscriptorError::Other("worker pool panicked".to_string())))
        });

        if let Err(e) = pool_result {
            if !checkpoint.is_empty() {
                self.save_checkpoint(&active.job.output, &mut checkpoint);
            }
            return if e.is_cancelled() {
                self.conclude(active, JobStage::Cancelled, Conclusion::default())
            } else {
                self.conclude(active, JobStage::Failed, Conclusion::error(e.to_string()))
            };
        }

        let missing = missing_indices(&results, total);
        if !missing.is_empty() {
            self.save_checkpoint(&active.job.output, &mut checkpoint);
            let message = format!("no result reported for chunks {missing:?}");
            return self.conclude(active, JobStage::Failed, Conclusion::error(message));
        }

        let results = sort_results(results);
        let merged = self.merger.merge(&results);
        let summary = TranscriptSummary::from_results(
            &results,
            total,
            reused_count,
            self.pool.model_name(),
            &self.pool.settings().language,
            self.pool.architecture(),
            active.started.elapsed().as_secs_f64(),
        );

        match write_artifacts(&active.job.output, &merged.text, &results, &summary) {
            Ok(artifacts) => {
                if let Err(e) = self.checkpoints.remove(&active.job.output) {
                    tracing::warn!(job_id = id, error = %e, "failed to remove checkpoint");
                }
                self.conclude(
                    active,
                    JobStage::Completed,
                    Conclusion {
                        error: None,
                        summary: Some(summary),
                        artifacts: Some(artifacts),
                    },
                )
            }
            Err(e) => {
                self.save_checkpoint(&active.job.output, &mut checkpoint);
                let message = format!("failed to write artifacts: {e}");
                self.conclude(active, JobStage::Failed, Conclusion::error(message))
            }
        }
    }

    fn load_checkpoint(&self, job: &PipelineJob, audio: &PreparedAudio) -> Checkpoint {
        match self.checkpoints.load(&job.output) {
            Ok(Some(mut checkpoint)) if checkpoint.matches(&job.input, audio) => {
                tracing::info!(job_id = job.id, chunks = checkpoint.len(), previous_job = checkpoint.job_id, "resuming from checkpoint");
                checkpoint.job_id = job.id;
                checkpoint
            }
            Ok(Some(_)) => {
                tracing::warn!(job_id = job.id, "checkpoint was written for another plan, starting fresh");
                Checkpoint::new(job.id, &job.input, audio)
            }
            Ok(None) => Checkpoint::new(job.id, &job.input, audio),
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "ignoring unreadable checkpoint");
                Checkpoint::new(job.id, &job.input, audio)
            }
        }
    }

    fn save_checkpoint(&self, output: &Path, checkpoint: &mut Checkpoint) {
        checkpoint.updated_at = chrono::Utc::now();
        match self.checkpoints.save(output, checkpoint) {
            Ok(()) => self.events.emit(PipelineEvent::CheckpointSaved {
                job_id: checkpoint.job_id,
                chunks: checkpoint.len(),
            }),
            Err(e) => tracing::warn!(job_id = checkpoint.job_id, error = %e, "checkpoint save failed"),
        }
    }

    fn advance(&self, active: &mut ActiveJob, to: JobStage) {
        if let Err(e) = active.stage.advance(to) {
            tracing::error!(job_id = active.job.id, error = %e, "unexpected stage change");
        }
    }

    /// Non-terminal ledger write; failures are logged only.
    fn note(&self, job_id: JobId, update: JobUpdate) {
        if let Err(e) = self.ledger.update(job_id, update) {
            tracing::warn!(job_id, error = %e, "ledger update failed");
        }
    }

    fn conclude(&self, mut active: ActiveJob, stage: JobStage, conclusion: Conclusion) -> JobOutcome {
        let id = active.job.id;
        self.advance(&mut active, stage);

        let update = match stage {
            JobStage::Completed => JobUpdate::status(JobStatus::Completed),
            JobStage::Cancelled => {
                let stopped = self
                    .supervisor
                    .terminate_job(id, Some(self.settings.graceful_timeout));
                if stopped > 0 {
                    tracing::info!(job_id = id, processes = stopped, "stopped job processes");
                }
                JobUpdate::status(JobStatus::Cancelled).with_error(defaults::CANCELLED_ERROR)
            }
            _ => JobUpdate::status(stage.ledger_status())
                .with_error(conclusion.error.clone().unwrap_or_default()),
        };
        let ledger_error = self.record_terminal(id, update);

        match stage {
            JobStage::Completed => {
                if let Some(summary) = &conclusion.summary {
                    tracing::info!(job_id = id, successful = summary.successful_chunks, total = summary.total_chunks, success_rate = summary.success_rate, "job completed");
                    self.events.emit(PipelineEvent::Completed {
                        job_id: id,
                        summary: summary.clone(),
                    });
                }
            }
            JobStage::Cancelled => {
                tracing::info!(job_id = id, "job cancelled");
                self.events.emit(PipelineEvent::Cancelled { job_id: id });
            }
            _ => {
                let error = conclusion.error.clone().unwrap_or_default();
                tracing::error!(job_id = id, error = %error, "job failed");
                self.events.emit(PipelineEvent::Failed { job_id: id, error });
            }
        }

        if !self.settings.keep_work_dir {
            remove_work_dir(id, &active.work_dir);
        }

        JobOutcome {
            job_id: id,
            input: active.job.input.clone(),
            stage,
            summary: conclusion.summary,
            artifacts: conclusion.artifacts,
            error: conclusion.error,
            ledger_error,
        }
    }

    /// Terminal ledger write. A job already terminal (stopped from outside)
    /// is left as is; other failures are returned.
    fn record_terminal(&self, job_id: JobId, update: JobUpdate) -> Option<String> {
        match self.ledger.update(job_id, update) {
            Ok(_) => None,
            Err(TranscriptorError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id, %from, "job already finished in ledger");
                None
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "terminal ledger write failed");
                Some(e.to_string())
            }
        }
    }
}

fn remove_work_dir(job_id: JobId, dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!(job_id, dir = %dir.display(), "work dir removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(job_id, dir = %dir.display(), error = %e, "failed to remove work dir"),
    }
}
