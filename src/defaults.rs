//! Default configuration constants for transcriptor.
//!
//! Shared by the config sections, the CLI and the components so that every
//! entry point agrees on the same tuning.

/// Core window length in seconds.
///
/// Twenty seconds keeps each chunk well inside the engine's 30-second
/// context while leaving room for the overlap padding on both sides.
pub const WINDOW_SECS: f64 = 20.0;

/// Overlap padding on each side of a core window, in seconds.
pub const OVERLAP_SECS: f64 = 3.0;

/// Longest overlap (in characters) the merger looks for.
pub const MERGE_MAX_OVERLAP_CHARS: usize = 200;

/// Shortest overlap (in characters) the merger accepts as a real match.
pub const MERGE_MIN_OVERLAP_CHARS: usize = 20;

/// Separator placed between merged chunk texts.
pub const MERGE_BOUNDARY: &str = "\n\n";

/// Number of process-level lanes in the worker pool.
pub const POOL_PROCESSES: usize = 2;

/// Threads per lane sharing one engine instance.
pub const THREADS_PER_PROCESS: usize = 8;

/// Interval between heartbeat refreshes and orphan scans.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Heartbeat age after which a "processing" job counts as orphaned.
pub const STALE_TIMEOUT_SECS: u64 = 60;

/// How long `stop` waits after SIGTERM before escalating to SIGKILL.
pub const GRACEFUL_TIMEOUT_SECS: u64 = 10;

/// Bounded wait for the reap after SIGKILL.
pub const KILL_REAP_TIMEOUT_SECS: u64 = 5;

/// Recent output lines kept in memory per tracked process.
pub const LOG_RING_LINES: usize = 1000;

/// Minimum progress change (percentage points) that triggers a ledger write.
pub const PROGRESS_STEP: f32 = 1.0;

/// Completed chunks between checkpoint saves.
pub const CHECKPOINT_EVERY: usize = 10;

/// Jobs prepared concurrently in the CPU stage.
pub const MAX_PARALLEL_PREPARATION: usize = 2;

/// Jobs the daemon runs at the same time.
pub const DAEMON_MAX_ACTIVE_JOBS: usize = 1;

/// Interval at which the daemon polls the ledger for pending jobs.
pub const DAEMON_POLL_MS: u64 = 1000;

/// Default engine identity.
pub const DEFAULT_MODEL: &str = "medium";

/// Default language hint passed to the engine.
///
/// "auto" lets the engine detect the spoken language.
pub const DEFAULT_LANGUAGE: &str = "auto";

/// Default engine command. Receives the chunk file and language hint and
/// prints `{"text": ..., "segments": [...]}` on stdout.
pub const DEFAULT_ENGINE_COMMAND: &str = "transcriptor-engine";

/// Sample rate of enhanced audio handed to the engine.
pub const SAMPLE_RATE: u32 = 16000;

/// Prefix of result lines emitted by lane worker processes.
pub const WORKER_RESULT_PREFIX: &str = "@chunk ";

/// Diagnostic stored on jobs reclaimed by the orphan scan.
pub const NO_HEARTBEAT_ERROR: &str = "Process terminated unexpectedly (no heartbeat)";

/// Graceful wait used for every tracked job when the supervisor shuts down.
pub const SHUTDOWN_STOP_TIMEOUT_SECS: u64 = 5;

/// Error text stored on jobs stopped on request.
pub const CANCELLED_ERROR: &str = "Cancelled by user";
