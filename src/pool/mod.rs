//! Hybrid process×thread worker pool.
//!
//! A job's chunks are dealt round-robin over P lanes (chunk i → lane i mod P).
//! Each lane runs T threads that share one engine instance behind one lock:
//!
//! ```text
//!              ┌ lane 0: chunks 0, P, 2P ... ─ T threads ─ Mutex<engine>
//! chunks ──────┼ lane 1: chunks 1, P+1 ...   ─ T threads ─ Mutex<engine>
//!              └ ...
//!                         results (unordered) ──▶ Sender<ChunkResult>
//! ```
//!
//! Lanes are thread groups in this process or `transcriptor worker` child
//! processes supervised by [`ProcessSupervisor`](crate::supervisor::ProcessSupervisor).

pub mod lane;
pub mod protocol;
pub mod subprocess;

pub use lane::run_lane;
pub use protocol::{LaneManifest, decode_line, encode_result};
pub use subprocess::{SubprocessLanes, run_worker};

use crate::cancel::CancelToken;
use crate::chunking::{ChunkDescriptor, ChunkResult};
use crate::config::{Config, LaneMode};
use crate::engine::EngineFactory;
use crate::error::{Result, TranscriptorError};
use crate::ledger::JobId;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::thread;

/// Shape of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub processes: usize,
    pub threads_per_process: usize,
    pub language: String,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            processes: config.pool.processes,
            threads_per_process: config.pool.threads_per_process,
            language: config.engine.language.clone(),
        }
    }
}

/// Deal chunks round-robin over `lanes` lanes.
///
/// Lane `l` receives chunks `l, l + lanes, l + 2·lanes, ...` in index order.
pub fn partition(chunks: &[ChunkDescriptor], lanes: usize) -> Vec<Vec<ChunkDescriptor>> {
    let lanes = lanes.max(1);
    let mut out = vec![Vec::new(); lanes];
    for (position, chunk) in chunks.iter().enumerate() {
        out[position % lanes].push(chunk.clone());
    }
    out
}

enum Lanes {
    InProcess(Arc<dyn EngineFactory>),
    Subprocess(SubprocessLanes),
}

/// P lanes of T threads each.
pub struct WorkerPool {
    settings: PoolSettings,
    lanes: Lanes,
    model_name: String,
}

impl WorkerPool {
    /// Lanes as thread groups of this process.
    pub fn in_process(settings: PoolSettings, factory: Arc<dyn EngineFactory>) -> Self {
        let model_name = factory.model_name();
        Self {
            settings,
            lanes: Lanes::InProcess(factory),
            model_name,
        }
    }

    /// Lanes as supervised worker processes.
    pub fn subprocess(settings: PoolSettings, lanes: SubprocessLanes, model_name: String) -> Self {
        Self {
            settings,
            lanes: Lanes::Subprocess(lanes),
            model_name,
        }
    }

    pub fn mode(&self) -> LaneMode {
        match self.lanes {
            Lanes::InProcess(_) => LaneMode::InProcess,
            Lanes::Subprocess(_) => LaneMode::Subprocess,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// `"PxT"`, e.g. `"2x8"`.
    pub fn architecture(&self) -> String {
        format!(
            "{}x{}",
            self.settings.processes, self.settings.threads_per_process
        )
    }

    /// Transcribe `chunks` of `job_id`, streaming results to `results`.
    ///
    /// Blocks until every lane finished. Each chunk yields exactly one
    /// result unless `cancel` fires, in which case unstarted chunks are
    /// abandoned and `Err(Cancelled)` is returned.
    pub fn run(
        &self,
        job_id: JobId,
        chunks: &[ChunkDescriptor],
        cancel: &CancelToken,
        results: &Sender<ChunkResult>,
    ) -> Result<usize> {
        cancel.checkpoint()?;
        let lanes = partition(chunks, self.settings.processes);
        let threads = self.settings.threads_per_process;
        let language = self.settings.language.as_str();
        tracing::info!(
            job_id,
            chunks = chunks.len(),
            architecture = %self.architecture(),
            mode = ?self.mode(),
            "transcribing"
        );

        let sent: usize = thread::scope(|scope| {
            let handles: Vec<_> = lanes
                .into_iter()
                .enumerate()
                .filter(|(_, lane_chunks)| !lane_chunks.is_empty())
                .map(|(lane, lane_chunks)| {
                    let handle = scope.spawn(move || match &self.lanes {
                        Lanes::InProcess(factory) => run_lane(
                            lane,
                            lane_chunks,
                            threads,
                            factory.as_ref(),
                            language,
                            cancel,
                            results,
                        ),
                        Lanes::Subprocess(processes) => processes.run_lane(
                            job_id,
                            lane,
                            lane_chunks,
                            threads,
                            language,
                            cancel,
                            results,
                        ),
                    });
                    (lane, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(lane, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        tracing::error!(job_id, lane, "lane driver panicked");
                        0
                    })
                })
                .sum()
        });

        if cancel.is_cancelled() {
            tracing::info!(job_id, sent, chunks = chunks.len(), "transcription cancelled");
            return Err(TranscriptorError::Cancelled);
        }
        Ok(sent)
    }
}
