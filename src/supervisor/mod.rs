//! Process supervisor.
//!
//! Owns every child process the crate spawns for long-running work, keeps a
//! bounded window of each child's merged stdout/stderr, mirrors progress and
//! liveness into the ledger and reclaims ledger rows whose owner vanished.
//!
//! ```text
//! start ──▶ ProcessRecord ──reader thread──▶ ring + log file + progress + observer
//!                 │                                 │
//!                 │                            EOF + exit ──▶ completed / failed
//!                 ▼
//! stop:  SIGTERM ─▶ wait(graceful) ─▶ SIGKILL ─▶ wait(reap) ─▶ cancelled
//! heartbeat loop: refresh alive jobs ─▶ reap exited ─▶ reclaim stale orphans
//! ```
//!
//! The supervisor is an ordinary value: construct it, share clones, call
//! [`ProcessSupervisor::start_heartbeat`] and finally
//! [`ProcessSupervisor::shutdown`].

mod heartbeat;
pub mod record;

pub use heartbeat::TickReport;
pub use record::{
    LogRing, ProcessSnapshot, ProcessStatus, ProgressTracker, TaskId, TaskRole, parse_progress,
};

use crate::config::Config;
use crate::defaults;
use crate::error::{Result, TranscriptorError};
use crate::ledger::{JobId, JobStatus, JobUpdate, Ledger};
use crate::sys::{Signal, SignalOutcome};
use chrono::{DateTime, Local, Utc};
use record::ProcessRecord;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines of output quoted in the error of a job whose process failed.
const FAILURE_TAIL_LINES: usize = 5;

/// Timing and storage knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub heartbeat_interval: Duration,
    pub stale_timeout: Duration,
    pub graceful_timeout: Duration,
    pub kill_reap_timeout: Duration,
    pub ring_lines: usize,
    pub log_dir: PathBuf,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.supervisor.heartbeat_interval(),
            stale_timeout: config.supervisor.stale_timeout(),
            graceful_timeout: config.supervisor.graceful_timeout(),
            kill_reap_timeout: Duration::from_secs(defaults::KILL_REAP_TIMEOUT_SECS),
            ring_lines: config.supervisor.ring_lines,
            log_dir: config.log_dir(),
        }
    }
}

/// Program, arguments and environment of a supervised process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn rendered(&self) -> String {
        crate::command::render(&self.program, &self.args)
    }
}

/// Receives output lines and the exit of a supervised process.
///
/// Called from supervisor threads; implementations must not block for long.
pub trait ProcessObserver: Send + Sync {
    fn on_line(&self, _task: &TaskId, _line: &str) {}

    fn on_exit(&self, _task: &TaskId, _status: ProcessStatus, _exit_code: Option<i32>) {}
}

/// Subprocess lifecycle manager.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Arc<dyn Ledger>,
    settings: SupervisorSettings,
    processes: Mutex<HashMap<TaskId, Arc<ProcessRecord>>>,
    /// In-process work heartbeated like a child (job id → holders)
    leases: Mutex<HashMap<JobId, usize>>,
    /// Last heartbeat per job
    heartbeats: Mutex<HashMap<JobId, DateTime<Utc>>>,
    heartbeat_loop: Mutex<Option<heartbeat::LoopHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl ProcessSupervisor {
    pub fn new(ledger: Arc<dyn Ledger>, settings: SupervisorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                settings,
                processes: Mutex::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
                heartbeats: Mutex::new(HashMap::new()),
                heartbeat_loop: Mutex::new(None),
            }),
        }
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.inner.ledger)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Spawn `spec` as `task` and start tracking it.
    ///
    /// stdout and stderr share one pipe read by a dedicated thread. For a
    /// job's main task the ledger row moves to processing with the child's
    /// pid and log file.
    pub fn start(
        &self,
        task: TaskId,
        spec: CommandSpec,
        observer: Option<Arc<dyn ProcessObserver>>,
    ) -> Result<u32> {
        if lock(&self.inner.processes).contains_key(&task) {
            return Err(TranscriptorError::Other(format!("{task} is already running")));
        }

        let log_dir = &self.inner.settings.log_dir;
        std::fs::create_dir_all(log_dir)?;
        let log_file = log_dir.join(format!(
            "{}_{}.log",
            task.file_stem(),
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        let rendered = spec.rendered();
        let (reader, writer) = std::io::pipe()?;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        let child = command
            .spawn()
            .map_err(|e| TranscriptorError::ProcessSpawn {
                command: rendered.clone(),
                message: e.to_string(),
            })?;
        // Close our copies of the write end so EOF arrives when the child exits
        drop(command);

        let record = Arc::new(ProcessRecord::new(
            task,
            child,
            rendered.clone(),
            log_file.clone(),
            self.inner.settings.ring_lines,
            observer,
        ));
        let pid = record.pid;
        {
            let mut processes = lock(&self.inner.processes);
            if processes.contains_key(&task) {
                drop(processes);
                record.begin_stop();
                if let Err(e) = record.child().kill() {
                    tracing::warn!(task = %task, pid, error = %e, "failed to kill duplicate task");
                }
                reap_within(&record, self.inner.settings.kill_reap_timeout);
                return Err(TranscriptorError::Other(format!("{task} is already running")));
            }
            processes.insert(task, Arc::clone(&record));
        }
        lock(&self.inner.heartbeats).insert(task.job_id, Utc::now());

        tracing::info!(job_id = task.job_id, pid, task = %task, command = %rendered, log_file = %log_file.display(), "started process");

        // Before the reader exists, so an instant exit cannot overtake it
        if task.is_main() {
            let update = JobUpdate::status(JobStatus::Processing)
                .with_pid(pid)
                .with_log_file(log_file);
            if let Err(e) = self.inner.ledger.update(task.job_id, update) {
                tracing::warn!(job_id = task.job_id, error = %e, "failed to record processing state");
            }
        }

        let inner = Arc::clone(&self.inner);
        let reader_record = Arc::clone(&record);
        if let Err(e) = thread::Builder::new()
            .name(format!("supervisor-{}", task.file_stem()))
            .spawn(move || inner.read_output(reader_record, reader))
        {
            self.inner
                .terminate(vec![record], None, ProcessStatus::Killed);
            return Err(e.into());
        }
        Ok(pid)
    }

    /// Gracefully stop every process of `job_id` and mark the job cancelled.
    ///
    /// Sends SIGTERM, waits up to `timeout`, escalates to SIGKILL, then waits
    /// a bounded time for the reap. Returns false when nothing was tracked.
    pub fn stop(&self, job_id: JobId, timeout: Duration) -> Result<bool> {
        if self.terminate_job(job_id, Some(timeout)) == 0 {
            return Ok(false);
        }
        self.inner
            .record_terminal(job_id, JobUpdate::status(JobStatus::Cancelled).with_error(defaults::CANCELLED_ERROR))?;
        Ok(true)
    }

    /// SIGKILL every process of `job_id` without a graceful phase.
    pub fn kill(&self, job_id: JobId) -> Result<bool> {
        if self.terminate_job(job_id, None) == 0 {
            return Ok(false);
        }
        self.inner
            .record_terminal(job_id, JobUpdate::status(JobStatus::Cancelled).with_error("Killed by user"))?;
        Ok(true)
    }

    /// Stop the processes of `job_id` without touching the ledger.
    ///
    /// `graceful` of `None` skips straight to SIGKILL. Returns the number of
    /// processes that were tracked.
    pub fn terminate_job(&self, job_id: JobId, graceful: Option<Duration>) -> usize {
        let records = self.inner.records_for(job_id);
        let count = records.len();
        if count > 0 {
            let status = if graceful.is_some() {
                ProcessStatus::Cancelled
            } else {
                ProcessStatus::Killed
            };
            self.inner.terminate(records, graceful, status);
        }
        count
    }

    /// Stop one task of a job.
    pub fn terminate_task(&self, task: TaskId, graceful: Option<Duration>) -> bool {
        let record = lock(&self.inner.processes).get(&task).cloned();
        match record {
            Some(record) => {
                let status = if graceful.is_some() {
                    ProcessStatus::Cancelled
                } else {
                    ProcessStatus::Killed
                };
                self.inner.terminate(vec![record], graceful, status);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.inner
            .records_for(job_id)
            .iter()
            .any(|record| record.try_exit().is_none())
    }

    pub fn is_tracked(&self, task: TaskId) -> bool {
        lock(&self.inner.processes).contains_key(&task)
    }

    /// The last `last_n` output lines of the job's main process.
    ///
    /// Falls back to a lane process, then to the log file named in the ledger
    /// once the job is no longer tracked.
    pub fn logs(&self, job_id: JobId, last_n: usize) -> Result<Vec<String>> {
        let records = self.inner.records_for(job_id);
        if let Some(record) = records
            .iter()
            .find(|r| r.task.is_main())
            .or_else(|| records.first())
        {
            return Ok(record.state().logs.tail(last_n));
        }

        let Some(job) = self.inner.ledger.get(job_id)? else {
            return Err(TranscriptorError::JobNotFound { job_id });
        };
        match job.log_file {
            Some(path) if path.exists() => tail_file(&path, last_n),
            _ => Ok(Vec::new()),
        }
    }

    /// Last parsed progress of the job's main process.
    pub fn progress(&self, job_id: JobId) -> Option<f32> {
        lock(&self.inner.processes)
            .get(&TaskId::main(job_id))
            .map(|record| record.state().progress.current())
    }

    /// Jobs with at least one live tracked process, ascending.
    pub fn running_jobs(&self) -> Vec<JobId> {
        let records: Vec<Arc<ProcessRecord>> =
            lock(&self.inner.processes).values().cloned().collect();
        records
            .iter()
            .filter(|r| r.try_exit().is_none())
            .map(|r| r.task.job_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let records: Vec<Arc<ProcessRecord>> =
            lock(&self.inner.processes).values().cloned().collect();
        let mut snapshots: Vec<ProcessSnapshot> = records.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by_key(|s| s.task);
        snapshots
    }

    /// Last heartbeat the supervisor recorded for `job_id`.
    pub fn last_heartbeat(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        lock(&self.inner.heartbeats).get(&job_id).copied()
    }

    /// Mark `job_id` as owned by this process while the lease is alive.
    ///
    /// Used for jobs executed in-process: the heartbeat loop refreshes them
    /// and the orphan scan skips them.
    pub fn register_local(&self, job_id: JobId) -> LocalLease {
        *lock(&self.inner.leases).entry(job_id).or_insert(0) += 1;
        lock(&self.inner.heartbeats).insert(job_id, Utc::now());
        if let Err(e) = self.inner.ledger.heartbeat(job_id) {
            tracing::warn!(job_id, error = %e, "initial heartbeat failed");
        }
        LocalLease {
            inner: Arc::downgrade(&self.inner),
            job_id,
        }
    }

    /// One heartbeat iteration: refresh, reap, reclaim orphans.
    pub fn heartbeat_tick(&self) -> TickReport {
        self.inner.tick()
    }

    /// Start the background heartbeat loop. No-op if already running.
    pub fn start_heartbeat(&self) -> Result<()> {
        let mut slot = lock(&self.inner.heartbeat_loop);
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(heartbeat::spawn_loop(
            Arc::downgrade(&self.inner),
            self.inner.settings.heartbeat_interval,
        )?);
        Ok(())
    }

    /// Stop the heartbeat loop and wait briefly for its thread.
    pub fn stop_heartbeat(&self) {
        let handle = lock(&self.inner.heartbeat_loop).take();
        if let Some(handle) = handle {
            handle.stop(Duration::from_secs(2));
        }
    }

    /// Stop every tracked job and the heartbeat loop.
    pub fn shutdown(&self) {
        let timeout = Duration::from_secs(defaults::SHUTDOWN_STOP_TIMEOUT_SECS)
            .min(self.inner.settings.graceful_timeout);
        let jobs: BTreeSet<JobId> = lock(&self.inner.processes)
            .keys()
            .map(|task| task.job_id)
            .collect();
        for job_id in jobs {
            if let Err(e) = self.stop(job_id, timeout) {
                tracing::warn!(job_id, error = %e, "failed to stop job during shutdown");
            }
        }
        self.stop_heartbeat();
        tracing::info!("supervisor shut down");
    }
}

/// Keeps a job heartbeated while held. See [`ProcessSupervisor::register_local`].
#[derive(Debug)]
pub struct LocalLease {
    inner: Weak<Inner>,
    job_id: JobId,
}

impl LocalLease {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut leases = lock(&inner.leases);
            if let Some(count) = leases.get_mut(&self.job_id) {
                *count -= 1;
                if *count == 0 {
                    leases.remove(&self.job_id);
                }
            }
        }
    }
}

impl Inner {
    fn records_for(&self, job_id: JobId) -> Vec<Arc<ProcessRecord>> {
        let mut records: Vec<Arc<ProcessRecord>> = lock(&self.processes)
            .values()
            .filter(|r| r.task.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.task);
        records
    }

    /// Job ids owned by this supervisor: tracked processes plus leases.
    fn local_jobs(&self) -> BTreeSet<JobId> {
        let mut jobs: BTreeSet<JobId> = lock(&self.processes)
            .keys()
            .map(|task| task.job_id)
            .collect();
        jobs.extend(lock(&self.leases).keys().copied());
        jobs
    }

    /// Job ids with a child still running or a lease held. Exited children
    /// awaiting finalization do not count.
    fn live_jobs(&self) -> BTreeSet<JobId> {
        let records: Vec<_> = lock(&self.processes).values().cloned().collect();
        let mut jobs: BTreeSet<JobId> = records
            .iter()
            .filter(|record| record.try_exit().is_none())
            .map(|record| record.task.job_id)
            .collect();
        jobs.extend(lock(&self.leases).keys().copied());
        jobs
    }

    fn read_output(&self, record: Arc<ProcessRecord>, pipe: std::io::PipeReader) {
        let mut log = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&record.log_file)
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(task = %record.task, path = %record.log_file.display(), error = %e, "cannot open process log");
                None
            }
        };

        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    self.handle_line(&record, line, &mut log);
                }
                Err(e) => {
                    tracing::warn!(task = %record.task, error = %e, "output read failed");
                    break;
                }
            }
        }

        record
            .output_closed
            .store(true, std::sync::atomic::Ordering::SeqCst);

        // The pipe can close before the process exits
        loop {
            if record.is_stopping() || record.state().status != ProcessStatus::Running {
                return;
            }
            if let Some(exit_code) = record.try_exit() {
                self.on_self_exit(&record, exit_code);
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn handle_line(&self, record: &ProcessRecord, line: String, log: &mut Option<File>) {
        if let Some(file) = log.as_mut()
            && let Err(e) = writeln!(file, "[{}] {}", Local::now().format("%H:%M:%S"), line)
        {
            tracing::warn!(task = %record.task, error = %e, "process log write failed, disabling");
            *log = None;
        }

        let progress = {
            let mut state = record.state();
            let progress = parse_progress(&line).and_then(|p| state.progress.observe(p));
            state.logs.push(line.clone());
            progress
        };

        if let Some(progress) = progress
            && record.task.is_main()
            && !record.is_stopping()
            && let Err(e) = self
                .ledger
                .update(record.task.job_id, JobUpdate::progress(progress))
        {
            tracing::warn!(job_id = record.task.job_id, progress, error = %e, "progress update failed");
        }

        if let Some(observer) = &record.observer {
            observer.on_line(&record.task, &line);
        }
    }

    /// Handle a process that exited without `stop`/`kill`. Returns true if
    /// this call finalized the record.
    fn on_self_exit(&self, record: &Arc<ProcessRecord>, exit_code: Option<i32>) -> bool {
        if record.is_stopping() {
            return false;
        }
        let status = if exit_code == Some(0) {
            ProcessStatus::Completed
        } else {
            ProcessStatus::Failed
        };
        if !self.finalize(record, status, exit_code) {
            return false;
        }

        tracing::info!(job_id = record.task.job_id, pid = record.pid, task = %record.task, status = %status, exit_code, "process exited");

        if record.task.is_main() {
            let update = if status == ProcessStatus::Completed {
                JobUpdate::status(JobStatus::Completed)
            } else {
                let tail = record.state().logs.tail(FAILURE_TAIL_LINES).join("\n");
                let reason = match exit_code {
                    Some(code) => format!("Process exited with code {code}"),
                    None => "Process terminated by signal".to_string(),
                };
                let error = if tail.is_empty() {
                    reason
                } else {
                    format!("{reason}\n{tail}")
                };
                JobUpdate::status(JobStatus::Failed).with_error(error)
            };
            if let Err(e) = self.record_terminal(record.task.job_id, update) {
                tracing::error!(job_id = record.task.job_id, error = %e, "failed to record process exit");
            }
        }
        true
    }

    /// Set the final status, untrack, notify. Returns false if the record
    /// was already final.
    fn finalize(&self, record: &Arc<ProcessRecord>, status: ProcessStatus, exit_code: Option<i32>) -> bool {
        if !record.finish(status, exit_code) {
            return false;
        }
        {
            let mut processes = lock(&self.processes);
            if processes
                .get(&record.task)
                .is_some_and(|tracked| Arc::ptr_eq(tracked, record))
            {
                processes.remove(&record.task);
            }
            let job_still_tracked = processes.keys().any(|t| t.job_id == record.task.job_id);
            drop(processes);
            if !job_still_tracked && !lock(&self.leases).contains_key(&record.task.job_id) {
                lock(&self.heartbeats).remove(&record.task.job_id);
            }
        }
        if let Some(observer) = &record.observer {
            observer.on_exit(&record.task, status, exit_code);
        }
        true
    }

    fn terminate(&self, records: Vec<Arc<ProcessRecord>>, graceful: Option<Duration>, status: ProcessStatus) {
        for record in &records {
            record.begin_stop();
        }

        if let Some(timeout) = graceful {
            for record in &records {
                match record.signal_if_running(Signal::Terminate) {
                    None | Some(SignalOutcome::Delivered) | Some(SignalOutcome::NoSuchProcess) => {}
                    Some(outcome) => {
                        tracing::warn!(task = %record.task, pid = record.pid, ?outcome, "SIGTERM not delivered");
                    }
                }
            }
            let deadline = Instant::now() + timeout;
            if !wait_all(&records, deadline) {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "graceful stop timed out, sending SIGKILL");
            }
        }

        for record in &records {
            if record.try_exit().is_none()
                && let Err(e) = record.child().kill()
            {
                tracing::warn!(task = %record.task, pid = record.pid, error = %e, "SIGKILL failed");
            }
        }

        let deadline = Instant::now() + self.settings.kill_reap_timeout;
        if !wait_all(&records, deadline) {
            tracing::error!("processes still alive after SIGKILL, untracking anyway");
        }

        for record in &records {
            let exit_code = record.try_exit().flatten();
            if self.finalize(record, status, exit_code) {
                tracing::info!(job_id = record.task.job_id, pid = record.pid, task = %record.task, status = %status, "process stopped");
            }
        }
    }

    /// Terminal ledger write; a job that is already terminal is left alone.
    fn record_terminal(&self, job_id: JobId, update: JobUpdate) -> Result<()> {
        match self.ledger.update(job_id, update) {
            Ok(_) => Ok(()),
            Err(TranscriptorError::InvalidTransition { from, to, .. }) => {
                tracing::debug!(job_id, %from, %to, "job already finished");
                Ok(())
            }
            Err(TranscriptorError::JobNotFound { .. }) => {
                tracing::debug!(job_id, "job not in ledger");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Poll until every record's child has exited or `deadline` passes.
fn wait_all(records: &[Arc<ProcessRecord>], deadline: Instant) -> bool {
    loop {
        if records.iter().all(|r| r.try_exit().is_some()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn reap_within(record: &Arc<ProcessRecord>, timeout: Duration) {
    if !wait_all(std::slice::from_ref(record), Instant::now() + timeout) {
        tracing::warn!(task = %record.task, pid = record.pid, "process not reaped in time");
    }
}

fn tail_file(path: &Path, last_n: usize) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = contents.lines().collect();
    let skip = lines.len().saturating_sub(last_n);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, tests::sample_job};

    fn settings(dir: &Path) -> SupervisorSettings {
        SupervisorSettings {
            heartbeat_interval: Duration::from_millis(100),
            stale_timeout: Duration::from_secs(60),
            graceful_timeout: Duration::from_secs(2),
            kill_reap_timeout: Duration::from_secs(2),
            ring_lines: 100,
            log_dir: dir.to_path_buf(),
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[test]
    fn test_command_spec_rendered() {
        let spec = CommandSpec::new("transcriptor").arg("run-job").args(["--job-id", "4"]);
        assert_eq!(spec.rendered(), "transcriptor run-job --job-id 4");
    }

    #[test]
    fn test_main_task_exit_zero_completes_job() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let job = ledger.create(sample_job("a")).unwrap();
        let supervisor = ProcessSupervisor::new(ledger.clone(), settings(dir.path()));

        let pid = supervisor
            .start(TaskId::main(job), sh("echo working 50%; echo done"), None)
            .unwrap();
        assert!(pid > 0);

        assert!(wait_until(Duration::from_secs(5), || {
            ledger.get(job).unwrap().unwrap().status == JobStatus::Completed
        }));
        let row = ledger.get(job).unwrap().unwrap();
        assert_eq!(row.pid, None);
        assert!(row.log_file.is_some());
        assert!(!supervisor.is_tracked(TaskId::main(job)));

        // Ring is gone with the record; logs come from the file
        let logs = supervisor.logs(job, 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].ends_with("] working 50%"));
    }

    #[test]
    fn test_main_task_failure_records_exit_code_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let job = ledger.create(sample_job("a")).unwrap();
        let supervisor = ProcessSupervisor::new(ledger.clone(), settings(dir.path()));

        supervisor
            .start(TaskId::main(job), sh("echo model missing >&2; exit 4"), None)
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            ledger.get(job).unwrap().unwrap().status == JobStatus::Failed
        }));
        let error = ledger.get(job).unwrap().unwrap().error.unwrap();
        assert!(error.contains("code 4"), "{error}");
        assert!(error.contains("model missing"), "{error}");
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let job = ledger.create(sample_job("a")).unwrap();
        let supervisor = ProcessSupervisor::new(ledger, settings(dir.path()));

        supervisor.start(TaskId::main(job), sh("sleep 30"), None).unwrap();
        assert!(supervisor.start(TaskId::main(job), sh("sleep 30"), None).is_err());
        assert!(supervisor.kill(job).unwrap());
    }

    #[test]
    fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            ProcessSupervisor::new(Arc::new(MemoryLedger::new()), settings(dir.path()));
        let err = supervisor
            .start(TaskId::main(1), CommandSpec::new("transcriptor-no-such-binary"), None)
            .unwrap_err();
        assert!(matches!(err, TranscriptorError::ProcessSpawn { .. }));
        assert!(supervisor.snapshot().is_empty());
    }

    #[test]
    fn test_progress_is_rate_limited_into_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let job = ledger.create(sample_job("a")).unwrap();
        let supervisor = ProcessSupervisor::new(ledger.clone(), settings(dir.path()));

        supervisor
            .start(
                TaskId::main(job),
                sh("echo 10%; echo 10.5%; echo 42.5%; sleep 30"),
                None,
            )
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            supervisor.progress(job) == Some(42.5)
        }));
        assert_eq!(ledger.get(job).unwrap().unwrap().progress, 42.5);
        assert!(supervisor.stop(job, Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn test_observer_receives_lines_and_exit() {
        #[derive(Default)]
        struct Collect {
            lines: Mutex<Vec<String>>,
            exits: Mutex<Vec<(ProcessStatus, Option<i32>)>>,
        }
        impl ProcessObserver for Collect {
            fn on_line(&self, _task: &TaskId, line: &str) {
                lock(&self.lines).push(line.to_string());
            }
            fn on_exit(&self, _task: &TaskId, status: ProcessStatus, exit_code: Option<i32>) {
                lock(&self.exits).push((status, exit_code));
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            ProcessSupervisor::new(Arc::new(MemoryLedger::new()), settings(dir.path()));
        let observer = Arc::new(Collect::default());
        supervisor
            .start(
                TaskId::lane(9, 0),
                sh("echo out; echo err >&2; exit 0"),
                Some(observer.clone()),
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || !lock(&observer.exits).is_empty()));
        let mut lines = lock(&observer.lines).clone();
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
        assert_eq!(lock(&observer.exits)[0], (ProcessStatus::Completed, Some(0)));
    }

    #[test]
    fn test_stop_without_tracked_process() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            ProcessSupervisor::new(Arc::new(MemoryLedger::new()), settings(dir.path()));
        assert!(!supervisor.stop(5, Duration::from_secs(1)).unwrap());
        assert!(!supervisor.kill(5).unwrap());
    }

    #[test]
    fn test_local_lease_keeps_job_local() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let job = ledger.create(sample_job("a")).unwrap();
        ledger
            .update(job, JobUpdate::status(JobStatus::Processing))
            .unwrap();
        ledger.backdate_heartbeat(job, Duration::from_secs(600)).unwrap();
        let supervisor = ProcessSupervisor::new(ledger.clone(), settings(dir.path()));

        let lease = supervisor.register_local(job);
        ledger.backdate_heartbeat(job, Duration::from_secs(600)).unwrap();
        let report = supervisor.heartbeat_tick();
        assert!(report.refreshed.contains(&job));
        assert!(report.reclaimed.is_empty());
        assert_eq!(ledger.get(job).unwrap().unwrap().status, JobStatus::Processing);
        assert!(supervisor.last_heartbeat(job).is_some());

        drop(lease);
        ledger.backdate_heartbeat(job, Duration::from_secs(600)).unwrap();
        let report = supervisor.heartbeat_tick();
        assert_eq!(report.reclaimed, vec![job]);
    }
}
