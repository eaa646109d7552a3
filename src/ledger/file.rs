//! JSON-file ledger shared between the daemon and CLI invocations.
//!
//! Every operation takes an exclusive `flock` on `<path>.lock`, re-reads the
//! document and, for writes, replaces it atomically through a temporary file
//! in the same directory.

use crate::error::{Result, TranscriptorError};
use crate::ledger::{Job, JobFilter, JobId, JobUpdate, Ledger, NewJob, apply_update, new_row, select};
use crate::sys::FileLock;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
}

#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    lock_path: PathBuf,
    // Serializes threads of this process; the flock serializes processes
    local: Mutex<()>,
}

impl FileLedger {
    /// Open (or lazily create) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: PathBuf::from(lock_name),
            local: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Document> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Document::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, doc: &Document) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.write_all(b"\n").map_err(write_error)?;
        tmp.as_file().sync_all().map_err(write_error)?;
        tmp.persist(&self.path)
            .map_err(|e| write_error(e.error))?;
        Ok(())
    }

    /// Run `f` with the document under both locks.
    fn with_document<T>(&self, mutate: bool, f: impl FnOnce(&mut Document) -> Result<T>) -> Result<T> {
        let _local = self.local.lock().map_err(|_| TranscriptorError::LedgerWrite {
            message: "ledger mutex poisoned".to_string(),
        })?;
        let _flock = FileLock::acquire(&self.lock_path).map_err(write_error)?;
        let mut doc = self.read()?;
        let value = f(&mut doc)?;
        if mutate {
            self.write(&doc)?;
        }
        Ok(value)
    }

    /// Move a job's heartbeat `age` into the past.
    pub fn backdate_heartbeat(&self, id: JobId, age: Duration) -> Result<()> {
        let age = chrono::Duration::from_std(age).map_err(|e| TranscriptorError::Other(e.to_string()))?;
        self.with_document(true, |doc| {
            let job = doc
                .jobs
                .get_mut(&id)
                .ok_or(TranscriptorError::JobNotFound { job_id: id })?;
            job.heartbeat_at = Some(Utc::now() - age);
            Ok(())
        })
    }
}

fn write_error(e: std::io::Error) -> TranscriptorError {
    TranscriptorError::LedgerWrite {
        message: e.to_string(),
    }
}

impl Ledger for FileLedger {
    fn create(&self, job: NewJob) -> Result<JobId> {
        self.with_document(true, |doc| {
            doc.next_id += 1;
            let id = doc.next_id;
            doc.jobs.insert(id, new_row(id, job, Utc::now()));
            Ok(id)
        })
    }

    fn update(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        self.with_document(true, |doc| {
            let job = doc
                .jobs
                .get_mut(&id)
                .ok_or(TranscriptorError::JobNotFound { job_id: id })?;
            apply_update(job, update, Utc::now())?;
            Ok(job.clone())
        })
    }

    fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.with_document(false, |doc| Ok(doc.jobs.get(&id).cloned()))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.with_document(false, |doc| Ok(select(doc.jobs.values().cloned(), filter)))
    }

    fn heartbeat(&self, id: JobId) -> Result<()> {
        self.with_document(true, |doc| {
            let job = doc
                .jobs
                .get_mut(&id)
                .ok_or(TranscriptorError::JobNotFound { job_id: id })?;
            job.heartbeat_at = Some(Utc::now());
            Ok(())
        })
    }

    fn delete(&self, id: JobId) -> Result<bool> {
        self.with_document(true, |doc| Ok(doc.jobs.remove(&id).is_some()))
    }
}
