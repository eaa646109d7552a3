use crate::error::{Result, TranscriptorError};
use crate::ledger::{Job, JobFilter, JobId, JobUpdate, Ledger, NewJob, apply_update, new_row, select};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
}

/// Ledger kept in process memory.
///
/// Used by `run-job` children and the batch runner, and by tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| TranscriptorError::LedgerWrite {
            message: "ledger mutex poisoned".to_string(),
        })
    }

    /// Move a job's heartbeat `age` into the past.
    pub fn backdate_heartbeat(&self, id: JobId, age: Duration) -> Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(TranscriptorError::JobNotFound { job_id: id })?;
        let age = chrono::Duration::from_std(age).map_err(|e| TranscriptorError::Other(e.to_string()))?;
        job.heartbeat_at = Some(Utc::now() - age);
        Ok(())
    }
}

impl Ledger for MemoryLedger {
    fn create(&self, job: NewJob) -> Result<JobId> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(id, new_row(id, job, Utc::now()));
        Ok(id)
    }

    fn update(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(TranscriptorError::JobNotFound { job_id: id })?;
        apply_update(job, update, Utc::now())?;
        Ok(job.clone())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.lock()?;
        Ok(select(state.jobs.values().cloned(), filter))
    }

    fn heartbeat(&self, id: JobId) -> Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(TranscriptorError::JobNotFound { job_id: id })?;
        job.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    fn delete(&self, id: JobId) -> Result<bool> {
        Ok(self.lock()?.jobs.remove(&id).is_some())
    }
}
