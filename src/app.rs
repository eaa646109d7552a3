//! Composition root.
//!
//! Wires config, ledger, supervisor, preparer, worker pool and orchestrator
//! together for the `supervise`, `submit`, `run-job`, `batch` and `worker`
//! commands.

use crate::cancel::CancelToken;
use crate::cli::JobOverrides;
use crate::config::{Config, LaneMode};
use crate::daemon::{Daemon, DaemonSettings, shutdown_signal};
use crate::engine::CommandEngineFactory;
use crate::error::{Result, TranscriptorError};
use crate::ledger::{FileLedger, Job, JobId, JobSettings, Ledger, MemoryLedger, NewJob};
use crate::pipeline::{
    CheckpointStore, JobOutcome, JobStage, PipelineEvent, PipelineJob, PipelineOrchestrator,
    PipelineSettings,
};
use crate::pool::{PoolSettings, SubprocessLanes, WorkerPool};
use crate::prepare::FfmpegPreparer;
use crate::supervisor::{ProcessSupervisor, SupervisorSettings};
use crossbeam_channel::unbounded;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Apply command line overrides to `config`.
pub fn apply_overrides(config: &mut Config, overrides: &JobOverrides) {
    if let Some(model) = &overrides.model {
        config.engine.model = model.clone();
    }
    if let Some(language) = &overrides.language {
        config.engine.language = language.clone();
    }
    if let Some(processes) = overrides.processes {
        config.pool.processes = processes;
    }
    if let Some(threads) = overrides.threads {
        config.pool.threads_per_process = threads;
    }
    if let Some(window) = overrides.window {
        config.chunking.window_secs = window;
    }
    if let Some(overlap) = overrides.overlap {
        config.chunking.overlap_secs = overlap;
    }
}

/// `config` with the settings a job was submitted with.
pub fn config_for_job(base: &Config, settings: &JobSettings) -> Config {
    let mut config = base.clone();
    config.engine.model = settings.model.clone();
    config.engine.language = settings.language.clone();
    config.pool.processes = settings.processes;
    config.pool.threads_per_process = settings.threads_per_process;
    config.chunking.window_secs = settings.window_secs;
    config.chunking.overlap_secs = settings.overlap_secs;
    config
}

/// Artifact base path for `input`: `<dir>/<stem>`, where `dir` defaults to
/// the input's directory.
pub fn default_output(input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "transcript".into());
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(stem)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

pub fn open_ledger(config: &Config) -> Result<Arc<FileLedger>> {
    Ok(Arc::new(FileLedger::open(&config.ledger_path())?))
}

pub fn build_supervisor(config: &Config, ledger: Arc<dyn Ledger>) -> ProcessSupervisor {
    ProcessSupervisor::new(ledger, SupervisorSettings::from_config(config))
}

/// Worker pool for `config`, hosting lanes as `mode` says.
pub fn build_pool(
    config: &Config,
    supervisor: &ProcessSupervisor,
    mode: LaneMode,
    cancel: &CancelToken,
) -> Result<WorkerPool> {
    let settings = PoolSettings::from_config(config);
    match mode {
        LaneMode::InProcess => Ok(WorkerPool::in_process(
            settings,
            Arc::new(CommandEngineFactory::new(config.engine.clone(), cancel.clone())),
        )),
        LaneMode::Subprocess => {
            let lanes = SubprocessLanes::current_exe(
                supervisor.clone(),
                config.engine.clone(),
                config.work_dir().join("manifests"),
            )?;
            Ok(WorkerPool::subprocess(settings, lanes, config.engine.model.clone()))
        }
    }
}

/// Orchestrator with the real preparer and engine.
pub fn build_orchestrator(
    config: &Config,
    supervisor: &ProcessSupervisor,
    mode: LaneMode,
    cancel: CancelToken,
) -> Result<PipelineOrchestrator> {
    config.validate()?;
    let preparer = Arc::new(FfmpegPreparer::new(&config.chunking)?);
    let pool = build_pool(config, supervisor, mode, &cancel)?;
    Ok(PipelineOrchestrator::new(
        supervisor.clone(),
        preparer,
        pool,
        CheckpointStore::new(config.checkpoint_dir()),
        PipelineSettings::from_config(config),
    )
    .with_cancel(cancel))
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn cancel_on_signal(token: CancelToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("cancelling on signal");
        token.cancel();
    })
}

/// Print pipeline events on stdout until the channel closes.
///
/// Chunk lines carry a percentage, which a supervising daemon parses as
/// job progress.
fn spawn_event_printer(
    rx: crossbeam_channel::Receiver<PipelineEvent>,
    quiet: bool,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for event in rx {
            let chunk_line = matches!(event, PipelineEvent::ChunkDone { .. });
            if !quiet || chunk_line {
                println!("{event}");
            }
        }
    })
}

/// `transcriptor supervise`
pub async fn run_supervise(
    config: Config,
    config_path: Option<PathBuf>,
    poll_interval: Option<Duration>,
    max_active: Option<usize>,
    quiet: bool,
) -> Result<()> {
    config.validate()?;
    let ledger = open_ledger(&config)?;
    let supervisor = build_supervisor(&config, ledger.clone());

    let mut settings = DaemonSettings::from_config(&config, config_path)?;
    if let Some(interval) = poll_interval {
        settings.poll_interval = interval;
    }
    if let Some(max) = max_active {
        settings.max_active_jobs = max.max(1);
    }

    if !quiet {
        eprintln!("transcriptor {}", crate::version_string());
        eprintln!("Ledger: {}", ledger.path().display());
        eprintln!("Logs:   {}", supervisor.settings().log_dir.display());
        eprintln!("Supervisor ready ({} active job(s) max).", settings.max_active_jobs);
    }
    Daemon::new(supervisor, settings).run().await
}

/// `transcriptor submit`
pub fn run_submit(
    mut config: Config,
    input: &Path,
    output: Option<&Path>,
    overrides: &JobOverrides,
) -> Result<JobId> {
    apply_overrides(&mut config, overrides);
    config.validate()?;
    if !input.is_file() {
        return Err(TranscriptorError::Other(format!(
            "input file not found: {}",
            input.display()
        )));
    }
    let input = absolute(input)?;
    let output = match output {
        Some(path) => absolute(path)?,
        None => default_output(&input, None),
    };

    let ledger = open_ledger(&config)?;
    let id = ledger.create(NewJob {
        input,
        output,
        settings: JobSettings::from_config(&config),
    })?;
    tracing::info!(job_id = id, "job submitted");
    Ok(id)
}

/// `transcriptor run-job`: run one ledger job in this process.
///
/// Returns the outcome; `ledger_error` is set only when the final state
/// could not be recorded.
pub async fn run_job_command(
    config: Config,
    job_id: JobId,
    lanes: Option<LaneMode>,
    quiet: bool,
) -> Result<JobOutcome> {
    let ledger = open_ledger(&config)?;
    let job: Job = ledger
        .get(job_id)?
        .ok_or(TranscriptorError::JobNotFound { job_id })?;
    if job.status.is_terminal() {
        return Err(TranscriptorError::Other(format!(
            "job {job_id} is already {}",
            job.status
        )));
    }

    let config = config_for_job(&config, &job.settings);
    let mode = lanes.unwrap_or(config.pool.lane_mode);
    let cancel = CancelToken::new();
    let supervisor = build_supervisor(&config, ledger);
    let orchestrator = match build_orchestrator(&config, &supervisor, mode, cancel.clone()) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            let update = crate::ledger::JobUpdate::status(crate::ledger::JobStatus::Failed)
                .with_error(e.to_string());
            if let Err(write_error) = supervisor.ledger().update(job_id, update) {
                tracing::error!(job_id, error = %write_error, "failed to record setup failure");
            }
            return Err(e);
        }
    };

    let (tx, rx) = unbounded();
    let orchestrator = orchestrator.with_events(tx);
    let printer = spawn_event_printer(rx, quiet);
    let signals = cancel_on_signal(cancel);

    let job = PipelineJob::from(&job);
    let outcome = tokio::task::spawn_blocking(move || orchestrator.run_job(job))
        .await
        .map_err(|e| TranscriptorError::Other(format!("job task failed: {e}")))?;
    signals.abort();
    if printer.join().is_err() {
        tracing::warn!("event printer panicked");
    }
    supervisor.shutdown();
    Ok(outcome)
}

/// `transcriptor batch`: run `inputs` through an in-memory ledger.
#[allow(clippy::too_many_arguments)]
pub async fn run_batch_command(
    mut config: Config,
    inputs: &[PathBuf],
    output_dir: Option<&Path>,
    parallel_preparation: Option<usize>,
    lanes: Option<LaneMode>,
    keep_work_dir: bool,
    overrides: &JobOverrides,
    quiet: bool,
) -> Result<Vec<JobOutcome>> {
    apply_overrides(&mut config, overrides);
    if let Some(n) = parallel_preparation {
        config.pipeline.max_parallel_preparation = n;
    }
    if keep_work_dir {
        config.pipeline.keep_work_dir = true;
    }
    let mode = lanes.unwrap_or(config.pool.lane_mode);

    let ledger = Arc::new(MemoryLedger::new());
    let mut jobs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let input = absolute(input)?;
        let output = default_output(&input, output_dir);
        let id = ledger.create(NewJob {
            input: input.clone(),
            output: output.clone(),
            settings: JobSettings::from_config(&config),
        })?;
        jobs.push(PipelineJob { id, input, output });
    }

    let cancel = CancelToken::new();
    let supervisor = build_supervisor(&config, ledger);
    supervisor.start_heartbeat()?;
    let orchestrator = build_orchestrator(&config, &supervisor, mode, cancel.clone())?;
    let (tx, rx) = unbounded();
    let orchestrator = orchestrator.with_events(tx);
    let printer = spawn_event_printer(rx, quiet);
    let signals = cancel_on_signal(cancel);

    let outcomes = tokio::task::spawn_blocking(move || orchestrator.run_batch(jobs))
        .await
        .map_err(|e| TranscriptorError::Other(format!("batch task failed: {e}")))?;
    signals.abort();
    if printer.join().is_err() {
        tracing::warn!("event printer panicked");
    }
    supervisor.shutdown();
    Ok(outcomes)
}

/// `transcriptor worker`
pub async fn run_worker_command(manifest: PathBuf) -> Result<usize> {
    let cancel = CancelToken::new();
    let signals = cancel_on_signal(cancel.clone());
    let reported = tokio::task::spawn_blocking(move || crate::pool::run_worker(&manifest, &cancel))
        .await
        .map_err(|e| TranscriptorError::Other(format!("worker task failed: {e}")))??;
    signals.abort();
    Ok(reported)
}

/// One line per outcome for the batch summary.
pub fn describe_outcome(outcome: &JobOutcome) -> String {
    let name = outcome
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| outcome.input.display().to_string());
    match (&outcome.stage, &outcome.summary) {
        (JobStage::Completed, Some(summary)) => format!(
            "{name}: completed, {}/{} chunks ({:.1}%), {:.1}s",
            summary.successful_chunks,
            summary.total_chunks,
            summary.success_rate,
            summary.processing_seconds
        ),
        (stage, _) => match &outcome.error {
            Some(error) => format!("{name}: {stage}: {error}"),
            None => format!("{name}: {stage}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TranscriptSummary;

    #[test]
    fn test_default_output() {
        assert_eq!(
            default_output(Path::new("/audio/talk.mp3"), None),
            PathBuf::from("/audio/talk")
        );
        assert_eq!(
            default_output(Path::new("/audio/talk.mp3"), Some(Path::new("/out"))),
            PathBuf::from("/out/talk")
        );
        assert_eq!(default_output(Path::new("talk"), None), PathBuf::from("talk"));
    }

    #[test]
    fn test_overrides_then_job_settings() {
        let mut config = Config::default();
        apply_overrides(
            &mut config,
            &JobOverrides {
                model: Some("large-v3".into()),
                processes: Some(3),
                window: Some(30.0),
                ..JobOverrides::default()
            },
        );
        assert_eq!(config.engine.model, "large-v3");
        assert_eq!(config.pool.processes, 3);
        assert_eq!(config.chunking.window_secs, 30.0);
        assert_eq!(config.pool.threads_per_process, Config::default().pool.threads_per_process);

        let settings = JobSettings::from_config(&config);
        let restored = config_for_job(&Config::default(), &settings);
        assert_eq!(restored.engine.model, "large-v3");
        assert_eq!(restored.pool.processes, 3);
        assert_eq!(restored.chunking.window_secs, 30.0);
    }

    #[test]
    fn test_submit_rejects_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.ledger.path = Some(dir.path().join("ledger.json"));
        let err = run_submit(config, &dir.path().join("nope.wav"), None, &JobOverrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("input file not found"));
    }

    #[test]
    fn test_submit_creates_pending_job() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("talk.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let mut config = Config::default();
        config.ledger.path = Some(dir.path().join("ledger.json"));

        let id = run_submit(
            config.clone(),
            &input,
            None,
            &JobOverrides {
                language: Some("th".into()),
                ..JobOverrides::default()
            },
        )
        .unwrap();

        let job = open_ledger(&config).unwrap().get(id).unwrap().unwrap();
        assert_eq!(job.status, crate::ledger::JobStatus::Pending);
        assert_eq!(job.output, dir.path().join("talk"));
        assert_eq!(job.settings.language, "th");
    }

    #[test]
    fn test_describe_outcome() {
        let failed = JobOutcome {
            job_id: 1,
            input: PathBuf::from("/a/b.wav"),
            stage: JobStage::Failed,
            summary: None,
            artifacts: None,
            error: Some("Preparation failed: boom".into()),
            ledger_error: None,
        };
        assert_eq!(describe_outcome(&failed), "b.wav: failed: Preparation failed: boom");

        let completed = JobOutcome {
            stage: JobStage::Completed,
            error: None,
            summary: Some(TranscriptSummary::from_results(&[], 0, 0, "m", "auto", "1x1".into(), 2.0)),
            ..failed
        };
        assert_eq!(describe_outcome(&completed), "b.wav: completed, 0/0 chunks (0.0%), 2.0s");
    }
}
