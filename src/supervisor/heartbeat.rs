//! Heartbeat loop and orphan reclamation.

use super::{Inner, lock};
use crate::defaults;
use crate::error::Result;
use crate::ledger::{JobId, JobStatus, JobUpdate};
use crate::sys::{Signal, SignalOutcome, send_signal};
use chrono::Utc;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What one heartbeat iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Jobs whose heartbeat was refreshed
    pub refreshed: Vec<JobId>,
    /// Jobs with a process found exited and finalized by this tick
    pub reaped: Vec<JobId>,
    /// Stale jobs marked failed
    pub reclaimed: Vec<JobId>,
}

impl Inner {
    pub(super) fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let records: Vec<_> = lock(&self.processes).values().cloned().collect();
        for record in &records {
            if record.is_stopping() {
                continue;
            }
            if let Some(exit_code) = record.try_exit()
                && record.reapable_by_tick()
                && self.on_self_exit(record, exit_code)
            {
                report.reaped.push(record.task.job_id);
            }
        }
        report.reaped.sort_unstable();
        report.reaped.dedup();

        let now = Utc::now();
        for job_id in self.live_jobs() {
            lock(&self.heartbeats).insert(job_id, now);
            match self.ledger.heartbeat(job_id) {
                Ok(()) => report.refreshed.push(job_id),
                Err(e) => tracing::warn!(job_id, error = %e, "heartbeat write failed"),
            }
        }

        report.reclaimed = self.reclaim_orphans(&self.local_jobs());
        report
    }

    /// Fail processing jobs with a stale heartbeat that nobody here owns.
    fn reclaim_orphans(&self, local: &BTreeSet<JobId>) -> Vec<JobId> {
        let stale = match self.ledger.stale_processing(self.settings.stale_timeout) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "orphan scan failed");
                return Vec::new();
            }
        };

        let mut reclaimed = Vec::new();
        for job in stale {
            if local.contains(&job.id) {
                continue;
            }
            if let Some(pid) = job.pid {
                match send_signal(pid, Signal::Terminate) {
                    SignalOutcome::Delivered => {
                        tracing::info!(job_id = job.id, pid, "sent SIGTERM to orphaned process");
                    }
                    SignalOutcome::NoSuchProcess => {
                        tracing::debug!(job_id = job.id, pid, "orphaned process already gone");
                    }
                    outcome => {
                        tracing::warn!(job_id = job.id, pid, ?outcome, "could not signal orphaned process");
                    }
                }
            }
            let update = JobUpdate::status(JobStatus::Failed).with_error(defaults::NO_HEARTBEAT_ERROR);
            match self.ledger.update(job.id, update) {
                Ok(_) => {
                    tracing::warn!(job_id = job.id, "reclaimed job with stale heartbeat");
                    reclaimed.push(job.id);
                }
                Err(e) => tracing::warn!(job_id = job.id, error = %e, "failed to reclaim stale job"),
            }
        }
        reclaimed
    }
}

/// Running heartbeat thread.
#[derive(Debug)]
pub(super) struct LoopHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl LoopHandle {
    /// Signal the loop and join it, detaching after `timeout`.
    pub(super) fn stop(self, timeout: Duration) {
        drop(self.stop_tx);
        let deadline = Instant::now() + timeout;
        while !self.thread.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("heartbeat thread did not stop in time, detaching");
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        if self.thread.join().is_err() {
            tracing::error!("heartbeat thread panicked");
        }
    }
}

/// Tick immediately, then every `interval` until stopped or the supervisor
/// is dropped.
pub(super) fn spawn_loop(inner: Weak<Inner>, interval: Duration) -> Result<LoopHandle> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let thread = thread::Builder::new()
        .name("supervisor-heartbeat".to_string())
        .spawn(move || {
            loop {
                match inner.upgrade() {
                    Some(inner) => {
                        let report = inner.tick();
                        if !report.reaped.is_empty() || !report.reclaimed.is_empty() {
                            tracing::debug!(?report, "heartbeat tick");
                        }
                    }
                    None => return,
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })?;
    Ok(LoopHandle { stop_tx, thread })
}
