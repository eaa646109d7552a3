//! Supervisor daemon: dispatches pending ledger jobs to `run-job` children.
//!
//! Each pass starts pending jobs while fewer than `max_active_jobs` are
//! running, and stops tracked jobs whose ledger row was cancelled from
//! outside (e.g. `transcriptor jobs cancel`). The heartbeat loop runs for
//! the lifetime of the daemon; shutdown stops every child.

use crate::config::Config;
use crate::error::{Result, TranscriptorError};
use crate::ledger::{JobFilter, JobId, JobStatus, JobUpdate, Ledger};
use crate::supervisor::{CommandSpec, ProcessSupervisor, TaskId};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// How the daemon launches and paces jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    pub poll_interval: Duration,
    pub max_active_jobs: usize,
    /// Executable started for each job
    pub program: PathBuf,
    /// Arguments placed before `run-job --job-id N`
    pub program_args: Vec<String>,
    /// Extra environment for job processes
    pub env: Vec<(String, String)>,
}

impl DaemonSettings {
    /// Run jobs with the current executable, passing the config file and
    /// the ledger location on.
    pub fn from_config(config: &Config, config_path: Option<PathBuf>) -> Result<Self> {
        let mut program_args = Vec::new();
        if let Some(path) = config_path {
            program_args.push("--config".to_string());
            program_args.push(path.to_string_lossy().into_owned());
        }
        Ok(Self {
            poll_interval: Duration::from_millis(crate::defaults::DAEMON_POLL_MS),
            max_active_jobs: config.pipeline.max_active_jobs.max(1),
            program: std::env::current_exe()?,
            program_args,
            env: vec![(
                "TRANSCRIPTOR_LEDGER".to_string(),
                config.ledger_path().to_string_lossy().into_owned(),
            )],
        })
    }
}

/// Result of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub started: Vec<JobId>,
    pub stopped: Vec<JobId>,
}

pub struct Daemon {
    supervisor: ProcessSupervisor,
    ledger: std::sync::Arc<dyn Ledger>,
    settings: DaemonSettings,
}

impl Daemon {
    pub fn new(supervisor: ProcessSupervisor, settings: DaemonSettings) -> Self {
        Self {
            ledger: supervisor.ledger(),
            supervisor,
            settings,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    fn job_command(&self, job_id: JobId) -> CommandSpec {
        let mut spec = CommandSpec::new(self.settings.program.to_string_lossy())
            .args(self.settings.program_args.iter().cloned())
            .args(["run-job".to_string(), "--job-id".to_string(), job_id.to_string()]);
        for (key, value) in &self.settings.env {
            spec = spec.env(key.clone(), value.clone());
        }
        spec
    }

    /// Start pending jobs up to the concurrency limit, oldest first.
    pub fn dispatch(&self) -> Result<Vec<JobId>> {
        let running = self.supervisor.running_jobs().len();
        let slots = self.settings.max_active_jobs.saturating_sub(running);
        if slots == 0 {
            return Ok(Vec::new());
        }

        let pending = self.ledger.list(&JobFilter::with_status(JobStatus::Pending))?;
        let mut started = Vec::new();
        for job in pending.into_iter().take(slots) {
            match self
                .supervisor
                .start(TaskId::main(job.id), self.job_command(job.id), None)
            {
                Ok(pid) => {
                    tracing::info!(job_id = job.id, pid, input = %job.input.display(), "dispatched job");
                    started.push(job.id);
                }
                Err(e) => {
                    tracing::error!(job_id = job.id, error = %e, "failed to start job");
                    let update = JobUpdate::status(JobStatus::Failed).with_error(e.to_string());
                    if let Err(e) = self.ledger.update(job.id, update) {
                        tracing::warn!(job_id = job.id, error = %e, "failed to record start failure");
                    }
                }
            }
        }
        Ok(started)
    }

    /// Stop tracked jobs that were cancelled or deleted in the ledger.
    pub fn reconcile_cancelled(&self) -> Vec<JobId> {
        let mut stopped = Vec::new();
        for job_id in self.supervisor.running_jobs() {
            let cancelled = match self.ledger.get(job_id) {
                Ok(Some(job)) => job.status == JobStatus::Cancelled,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "cannot read job during reconcile");
                    false
                }
            };
            if !cancelled {
                continue;
            }
            tracing::info!(job_id, "job cancelled in ledger, stopping its processes");
            match self
                .supervisor
                .stop(job_id, self.supervisor.settings().graceful_timeout)
            {
                Ok(true) => stopped.push(job_id),
                Ok(false) => {}
                Err(e) => tracing::warn!(job_id, error = %e, "failed to stop cancelled job"),
            }
        }
        stopped
    }

    /// One reconcile + dispatch pass.
    pub fn pass(&self) -> Result<PassReport> {
        let stopped = self.reconcile_cancelled();
        let started = self.dispatch()?;
        Ok(PassReport { started, stopped })
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves, then stop every child.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.supervisor.start_heartbeat()?;
        tracing::info!(
            max_active_jobs = self.settings.max_active_jobs,
            ledger_jobs = self.ledger.list(&JobFilter::default()).map(|j| j.len()).unwrap_or(0),
            "daemon ready"
        );

        let daemon = std::sync::Arc::new(self);
        let mut ticker = tokio::time::interval(daemon.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let worker = std::sync::Arc::clone(&daemon);
                    match tokio::task::spawn_blocking(move || worker.pass()).await {
                        Ok(Ok(report)) => {
                            if !report.started.is_empty() || !report.stopped.is_empty() {
                                tracing::debug!(started = ?report.started, stopped = ?report.stopped, "dispatch pass");
                            }
                        }
                        Ok(Err(e)) => tracing::error!(error = %e, "dispatch pass failed"),
                        Err(e) => tracing::error!(error = %e, "dispatch task panicked"),
                    }
                }
            }
        }

        tracing::info!("daemon shutting down");
        let supervisor = daemon.supervisor.clone();
        tokio::task::spawn_blocking(move || supervisor.shutdown())
            .await
            .map_err(|e| TranscriptorError::Other(format!("shutdown task failed: {e}")))?;
        tracing::info!("daemon stopped");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
            tracing::info!("received SIGINT");
        }
        result = wait_for_sigterm() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
            tracing::info!("received SIGTERM");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| TranscriptorError::Other(format!("Failed to register SIGTERM handler: {e}")))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
