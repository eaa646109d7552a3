//! Pool lanes hosted in `transcriptor worker` child processes.

use crate::cancel::CancelToken;
use crate::chunking::{ChunkDescriptor, ChunkResult};
use crate::config::EngineConfig;
use crate::error::{Result, TranscriptorError};
use crate::engine::CommandEngineFactory;
use crate::ledger::JobId;
use crate::pool::lane::run_lane;
use crate::pool::protocol::{LaneManifest, decode_line, encode_result};
use crate::supervisor::{CommandSpec, ProcessObserver, ProcessStatus, ProcessSupervisor, TaskId};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Spawns lane processes under a [`ProcessSupervisor`].
#[derive(Clone)]
pub struct SubprocessLanes {
    supervisor: ProcessSupervisor,
    program: PathBuf,
    engine: EngineConfig,
    manifest_dir: PathBuf,
    graceful_timeout: Duration,
}

impl SubprocessLanes {
    /// `program` is the `transcriptor` binary; manifests go to `manifest_dir`.
    pub fn new(
        supervisor: ProcessSupervisor,
        program: PathBuf,
        engine: EngineConfig,
        manifest_dir: PathBuf,
    ) -> Self {
        let graceful_timeout = supervisor.settings().graceful_timeout;
        Self {
            supervisor,
            program,
            engine,
            manifest_dir,
            graceful_timeout,
        }
    }

    /// Lanes running the current executable.
    pub fn current_exe(
        supervisor: ProcessSupervisor,
        engine: EngineConfig,
        manifest_dir: PathBuf,
    ) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(supervisor, program, engine, manifest_dir))
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Run one lane process to completion.
    ///
    /// Results stream to `results` as the worker reports them. Chunks the
    /// worker never reported are sent as failures, unless `cancel` fired.
    pub fn run_lane(
        &self,
        job_id: JobId,
        lane: usize,
        chunks: Vec<ChunkDescriptor>,
        threads: usize,
        language: &str,
        cancel: &CancelToken,
        results: &Sender<ChunkResult>,
    ) -> usize {
        if chunks.is_empty() {
            return 0;
        }
        let task = TaskId::lane(job_id, lane);
        let manifest_path = self
            .manifest_dir
            .join(format!("{}.json", task.file_stem()));
        let manifest = LaneManifest {
            job_id,
            lane,
            threads,
            language: language.to_string(),
            engine: self.engine.clone(),
            chunks: chunks.clone(),
        };

        let (done_tx, done_rx) = bounded(1);
        let observer = Arc::new(LaneObserver {
            expected: chunks.iter().map(|c| c.index).collect(),
            reported: Mutex::new(HashSet::new()),
            results: results.clone(),
            exit: Mutex::new(None),
            done: done_tx,
        });

        let started = std::fs::create_dir_all(&self.manifest_dir)
            .map_err(TranscriptorError::from)
            .and_then(|()| manifest.write(&manifest_path))
            .and_then(|()| {
                let spec = CommandSpec::new(self.program.to_string_lossy())
                    .arg("worker")
                    .arg("--manifest")
                    .arg(manifest_path.to_string_lossy());
                self.supervisor.start(task, spec, Some(observer.clone()))
            });

        let mut sent = 0;
        match started {
            Ok(pid) => {
                tracing::info!(job_id, lane, pid, chunks = chunks.len(), "lane process started");
                self.wait(task, cancel, &done_rx);
                sent += observer.reported_count();
            }
            Err(e) => {
                tracing::error!(job_id, lane, error = %e, "lane process failed to start");
                observer.set_exit_reason(format!("lane process failed to start: {e}"));
            }
        }

        if !cancel.is_cancelled() {
            let reason = observer.exit_reason();
            for chunk in observer.claim_unreported(&chunks) {
                tracing::warn!(job_id, lane, chunk = chunk.index, reason = %reason, "chunk never reported");
                if results.send(ChunkResult::failure(chunk, reason.clone())).is_ok() {
                    sent += 1;
                }
            }
        }

        remove_manifest(&manifest_path);
        sent
    }

    fn wait(&self, task: TaskId, cancel: &CancelToken, done: &Receiver<()>) {
        let mut stop_sent = false;
        loop {
            match done.recv_timeout(CANCEL_POLL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if cancel.is_cancelled() && !stop_sent {
                stop_sent = true;
                tracing::info!(task = %task, "stopping lane process");
                if !self
                    .supervisor
                    .terminate_task(task, Some(self.graceful_timeout))
                {
                    return;
                }
            }
        }
    }
}

fn remove_manifest(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove lane manifest");
    }
}

/// Collects protocol lines of one lane process.
struct LaneObserver {
    expected: HashSet<usize>,
    reported: Mutex<HashSet<usize>>,
    results: Sender<ChunkResult>,
    exit: Mutex<Option<String>>,
    done: Sender<()>,
}

impl LaneObserver {
    fn reported_count(&self) -> usize {
        self.reported.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Chunks not reported yet. They count as reported from here on, so a
    /// line drained after the exit is dropped.
    fn claim_unreported<'a>(&self, chunks: &'a [ChunkDescriptor]) -> Vec<&'a ChunkDescriptor> {
        let mut reported = self.reported.lock().unwrap_or_else(|p| p.into_inner());
        chunks
            .iter()
            .filter(|c| reported.insert(c.index))
            .collect()
    }

    fn set_exit_reason(&self, reason: String) {
        *self.exit.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason);
    }

    fn exit_reason(&self) -> String {
        self.exit
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or_else(|| "lane process did not report this chunk".to_string())
    }
}

impl ProcessObserver for LaneObserver {
    fn on_line(&self, task: &TaskId, line: &str) {
        let result = match decode_line(line) {
            None => return,
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                tracing::warn!(task = %task, error = %e, "ignoring malformed worker line");
                return;
            }
        };
        if !self.expected.contains(&result.index) {
            tracing::warn!(task = %task, chunk = result.index, "worker reported a chunk it was not given");
            return;
        }
        let first = self
            .reported
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(result.index);
        if first && self.results.send(result).is_err() {
            tracing::debug!(task = %task, "result receiver gone");
        }
    }

    fn on_exit(&self, _task: &TaskId, status: ProcessStatus, exit_code: Option<i32>) {
        let reason = match (status, exit_code) {
            (ProcessStatus::Completed, _) => "lane process exited without reporting this chunk".to_string(),
            (_, Some(code)) => format!("lane process {status} with exit code {code}"),
            (_, None) => format!("lane process {status} by signal"),
        };
        self.set_exit_reason(reason);
        if self.done.try_send(()).is_err() {
            tracing::debug!("lane exit already signalled");
        }
    }
}

/// Entry point of `transcriptor worker`: run the manifest's lane in this
/// process and print one protocol line per result.
pub fn run_worker(manifest_path: &Path, cancel: &CancelToken) -> Result<usize> {
    let manifest = LaneManifest::read(manifest_path)?;
    let factory = CommandEngineFactory::new(manifest.engine.clone(), cancel.clone());
    let total = manifest.chunks.len();
    tracing::info!(job_id = manifest.job_id, lane = manifest.lane, chunks = total, threads = manifest.threads, "worker started");

    let (tx, rx) = unbounded::<ChunkResult>();
    std::thread::scope(|scope| -> Result<usize> {
        let lane = manifest.lane;
        let threads = manifest.threads;
        let language = manifest.language.as_str();
        let chunks = manifest.chunks.clone();
        let factory = &factory;
        let worker = scope.spawn(move || run_lane(lane, chunks, threads, factory, language, cancel, &tx));

        let stdout = std::io::stdout();
        let mut done = 0;
        for result in rx {
            done += 1;
            let mut out = stdout.lock();
            writeln!(out, "{}", encode_result(&result)?)?;
            writeln!(
                out,
                "lane {lane}: {done}/{total} chunks ({:.1}%)",
                done as f64 * 100.0 / total.max(1) as f64
            )?;
            out.flush()?;
        }
        if worker.join().is_err() {
            tracing::error!(lane, "lane thread panicked");
        }
        Ok(done)
    })
}
