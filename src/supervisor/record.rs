//! Per-process bookkeeping: task identity, status, log ring and progress.

use crate::defaults;
use crate::ledger::JobId;
use crate::supervisor::ProcessObserver;
use crate::sys::{Signal, SignalOutcome, send_signal};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// What a supervised process does for its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "lane")]
pub enum TaskRole {
    /// The process that owns the job (its pid is recorded in the ledger)
    Main,
    /// A worker-pool lane process
    Lane(usize),
}

/// Key of the supervisor's process map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId {
    pub job_id: JobId,
    pub role: TaskRole,
}

impl TaskId {
    pub fn main(job_id: JobId) -> Self {
        Self {
            job_id,
            role: TaskRole::Main,
        }
    }

    pub fn lane(job_id: JobId, lane: usize) -> Self {
        Self {
            job_id,
            role: TaskRole::Lane(lane),
        }
    }

    pub fn is_main(&self) -> bool {
        self.role == TaskRole::Main
    }

    /// Log file name stem, e.g. `job_3` or `job_3_lane1`.
    pub fn file_stem(&self) -> String {
        match self.role {
            TaskRole::Main => format!("job_{}", self.job_id),
            TaskRole::Lane(lane) => format!("job_{}_lane{}", self.job_id, lane),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            TaskRole::Main => write!(f, "job {}", self.job_id),
            TaskRole::Lane(lane) => write!(f, "job {} lane {}", self.job_id, lane),
        }
    }
}

/// Lifecycle tag of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Killed,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Cancelled => "cancelled",
            ProcessStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded buffer of the most recent output lines.
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(defaults::LOG_RING_LINES)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// First percentage (`12%`, `45.5%`) in a line of output.
pub fn parse_progress(line: &str) -> Option<f32> {
    let bytes = line.as_bytes();
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        match (b, start) {
            (b'0'..=b'9', None) => start = Some(i),
            (b'0'..=b'9' | b'.', Some(_)) => {}
            (b'%', Some(s)) => {
                if let Ok(value) = line[s..i].trim_end_matches('.').parse::<f32>()
                    && value.is_finite()
                {
                    return Some(value);
                }
                start = None;
            }
            _ => start = None,
        }
    }
    None
}

/// Suppresses progress updates smaller than `step` percentage points.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    current: f32,
    step: f32,
}

impl ProgressTracker {
    pub fn new(step: f32) -> Self {
        Self { current: 0.0, step }
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    /// Record `value`; returns it only when it moved by at least `step`.
    pub fn observe(&mut self, value: f32) -> Option<f32> {
        if (value - self.current).abs() >= self.step {
            self.current = value;
            Some(value)
        } else {
            None
        }
    }
}

/// Mutable part of a record.
#[derive(Debug)]
pub(crate) struct RecordState {
    pub logs: LogRing,
    pub progress: ProgressTracker,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
}

/// A tracked child process. Created on spawn, dropped from the map on reap.
pub(crate) struct ProcessRecord {
    pub task: TaskId,
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub log_file: PathBuf,
    pub child: Mutex<Child>,
    pub state: Mutex<RecordState>,
    /// Set once `stop`/`kill` takes over the exit path
    pub stopping: AtomicBool,
    /// Set by the reader thread at EOF
    pub output_closed: AtomicBool,
    /// Set by the first heartbeat tick that saw the child exited
    pub exit_seen: AtomicBool,
    pub observer: Option<Arc<dyn ProcessObserver>>,
}

impl ProcessRecord {
    pub fn new(
        task: TaskId,
        child: Child,
        command: String,
        log_file: PathBuf,
        ring_lines: usize,
        observer: Option<Arc<dyn ProcessObserver>>,
    ) -> Self {
        Self {
            task,
            pid: child.id(),
            command,
            started_at: Utc::now(),
            log_file,
            child: Mutex::new(child),
            state: Mutex::new(RecordState {
                logs: LogRing::new(ring_lines),
                progress: ProgressTracker::new(defaults::PROGRESS_STEP),
                status: ProcessStatus::Running,
                exit_code: None,
            }),
            stopping: AtomicBool::new(false),
            output_closed: AtomicBool::new(false),
            exit_seen: AtomicBool::new(false),
            observer,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, RecordState> {
        // A poisoned state only means a reader thread panicked mid-push
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Claim the stop path. Returns false if someone already did.
    pub fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    /// True once the tick may finalize an exited child: its output is fully
    /// read, or it was already seen exited on an earlier tick.
    pub fn reapable_by_tick(&self) -> bool {
        self.output_closed.load(Ordering::SeqCst) || self.exit_seen.swap(true, Ordering::SeqCst)
    }

    /// Send `signal` unless the child has already been reaped.
    ///
    /// The check and the signal happen under the child lock so a reaped
    /// (and possibly reused) pid is never signalled.
    pub fn signal_if_running(&self, signal: Signal) -> Option<SignalOutcome> {
        let mut child = self.child();
        match child.try_wait() {
            Ok(None) => Some(send_signal(self.pid, signal)),
            _ => None,
        }
    }

    /// Non-blocking exit check; `Some(code)` once the child has exited
    /// (`None` inside for signal deaths).
    pub fn try_exit(&self) -> Option<Option<i32>> {
        match self.child().try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(task = %self.task, pid = self.pid, error = %e, "try_wait failed");
                Some(None)
            }
        }
    }

    /// Move out of `Running`. Returns false if the status was already final.
    pub fn finish(&self, status: ProcessStatus, exit_code: Option<i32>) -> bool {
        let mut state = self.state();
        if state.status != ProcessStatus::Running {
            return false;
        }
        state.status = status;
        state.exit_code = exit_code;
        true
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let state = self.state();
        ProcessSnapshot {
            task: self.task,
            pid: self.pid,
            command: self.command.clone(),
            started_at: self.started_at,
            status: state.status,
            progress: state.progress.current(),
            exit_code: state.exit_code,
            log_file: self.log_file.clone(),
            buffered_lines: state.logs.len(),
        }
    }
}

/// Read-only view of a tracked process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub task: TaskId,
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub status: ProcessStatus,
    pub progress: f32,
    pub exit_code: Option<i32>,
    pub log_file: PathBuf,
    pub buffered_lines: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_ring_is_bounded() {
        let mut ring = LogRing::new(3);
        for i in 0..10 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.tail(10), vec!["line 7", "line 8", "line 9"]);
        assert_eq!(ring.tail(1), vec!["line 9"]);
        assert!(ring.tail(0).is_empty());
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("Transcribing: 45%"), Some(45.0));
        assert_eq!(parse_progress("[12.5%] chunk 3/24"), Some(12.5));
        assert_eq!(parse_progress("100% done, 3% errors"), Some(100.0));
        assert_eq!(parse_progress("5.%"), Some(5.0));
        assert_eq!(parse_progress("no progress here"), None);
        assert_eq!(parse_progress("% alone"), None);
        assert_eq!(parse_progress("ratio 3 %"), None);
    }

    #[test]
    fn test_progress_tracker_rate_limits() {
        let mut tracker = ProgressTracker::new(1.0);
        assert_eq!(tracker.observe(0.5), None);
        assert_eq!(tracker.observe(1.0), Some(1.0));
        assert_eq!(tracker.observe(1.9), None);
        assert_eq!(tracker.observe(2.0), Some(2.0));
        assert_eq!(tracker.observe(50.0), Some(50.0));
        assert_eq!(tracker.current(), 50.0);
    }

    #[test]
    fn test_task_display_and_stem() {
        assert_eq!(TaskId::main(3).to_string(), "job 3");
        assert_eq!(TaskId::lane(3, 1).to_string(), "job 3 lane 1");
        assert_eq!(TaskId::main(3).file_stem(), "job_3");
        assert_eq!(TaskId::lane(3, 1).file_stem(), "job_3_lane1");
        assert!(TaskId::main(1).is_main());
        assert!(!TaskId::lane(1, 0).is_main());
    }

    #[test]
    fn test_finish_only_once() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let record = ProcessRecord::new(TaskId::main(1), child, "true".into(), PathBuf::new(), 10, None);
        assert!(record.finish(ProcessStatus::Completed, Some(0)));
        assert!(!record.finish(ProcessStatus::Failed, Some(1)));
        assert_eq!(record.snapshot().status, ProcessStatus::Completed);
        record.child().wait().unwrap();
    }
}
