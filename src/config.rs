use crate::defaults;
use crate::error::{Result, TranscriptorError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub pool: PoolConfig,
    pub chunking: ChunkingConfig,
    pub merge: MergeConfig,
    pub supervisor: SupervisorSection,
    pub pipeline: PipelineSection,
    pub ledger: LedgerSection,
}

/// Speech-recognition engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// External program invoked once per chunk
    pub command: String,
    /// Extra arguments placed before `--model`/`--language`/file
    pub args: Vec<String>,
    pub model: String,
    pub language: String,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub processes: usize,
    pub threads_per_process: usize,
    pub lane_mode: LaneMode,
}

/// How pool lanes are hosted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LaneMode {
    /// Lanes are thread groups inside the current process
    InProcess,
    /// Lanes are `transcriptor worker` child processes
    Subprocess,
}

/// Chunk planning and preparation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub window_secs: f64,
    pub overlap_secs: f64,
    /// Run the enhancement filter chain before cutting windows
    pub enhance: bool,
}

/// Overlap merge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    pub max_overlap: usize,
    pub min_overlap: usize,
    pub boundary: String,
}

/// Process supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorSection {
    pub heartbeat_interval_secs: u64,
    pub stale_timeout_secs: u64,
    pub graceful_timeout_secs: u64,
    pub ring_lines: usize,
    pub log_dir: Option<PathBuf>,
}

/// Pipeline orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub max_parallel_preparation: usize,
    pub checkpoint_every: usize,
    pub checkpoint_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub keep_work_dir: bool,
    /// Jobs the daemon runs concurrently
    pub max_active_jobs: usize,
}

/// Job ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LedgerSection {
    pub path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: defaults::DEFAULT_ENGINE_COMMAND.to_string(),
            args: Vec::new(),
            model: defaults::DEFAULT_MODEL.to_string(),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processes: defaults::POOL_PROCESSES,
            threads_per_process: defaults::THREADS_PER_PROCESS,
            lane_mode: LaneMode::Subprocess,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_secs: defaults::WINDOW_SECS,
            overlap_secs: defaults::OVERLAP_SECS,
            enhance: true,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_overlap: defaults::MERGE_MAX_OVERLAP_CHARS,
            min_overlap: defaults::MERGE_MIN_OVERLAP_CHARS,
            boundary: defaults::MERGE_BOUNDARY.to_string(),
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
            stale_timeout_secs: defaults::STALE_TIMEOUT_SECS,
            graceful_timeout_secs: defaults::GRACEFUL_TIMEOUT_SECS,
            ring_lines: defaults::LOG_RING_LINES,
            log_dir: None,
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_parallel_preparation: defaults::MAX_PARALLEL_PREPARATION,
            checkpoint_every: defaults::CHECKPOINT_EVERY,
            checkpoint_dir: None,
            work_dir: None,
            keep_work_dir: false,
            max_active_jobs: defaults::DAEMON_MAX_ACTIVE_JOBS,
        }
    }
}

impl SupervisorSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                let missing = e
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound);
                if missing {
                    Ok(Self::default())
                } else {
                    Err(e.context(format!("Failed to load config from {}", path.display())))
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - TRANSCRIPTOR_MODEL → engine.model
    /// - TRANSCRIPTOR_LANGUAGE → engine.language
    /// - TRANSCRIPTOR_LEDGER → ledger.path
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("TRANSCRIPTOR_MODEL")
            && !model.is_empty()
        {
            self.engine.model = model;
        }

        if let Ok(language) = std::env::var("TRANSCRIPTOR_LANGUAGE")
            && !language.is_empty()
        {
            self.engine.language = language;
        }

        if let Ok(ledger) = std::env::var("TRANSCRIPTOR_LEDGER")
            && !ledger.is_empty()
        {
            self.ledger.path = Some(PathBuf::from(ledger));
        }

        self
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.chunking.window_secs.is_finite() && self.chunking.window_secs > 0.0) {
            return Err(invalid("chunking.window_secs", "must be a positive number"));
        }
        if !(self.chunking.overlap_secs.is_finite() && self.chunking.overlap_secs >= 0.0) {
            return Err(invalid("chunking.overlap_secs", "must not be negative"));
        }
        if self.pool.processes == 0 {
            return Err(invalid("pool.processes", "must be at least 1"));
        }
        if self.pool.threads_per_process == 0 {
            return Err(invalid("pool.threads_per_process", "must be at least 1"));
        }
        if self.merge.min_overlap == 0 || self.merge.min_overlap > self.merge.max_overlap {
            return Err(invalid(
                "merge.min_overlap",
                "must be between 1 and merge.max_overlap",
            ));
        }
        if self.supervisor.heartbeat_interval_secs == 0 {
            return Err(invalid("supervisor.heartbeat_interval_secs", "must be positive"));
        }
        if self.supervisor.stale_timeout_secs <= self.supervisor.heartbeat_interval_secs {
            return Err(invalid(
                "supervisor.stale_timeout_secs",
                "must be longer than the heartbeat interval",
            ));
        }
        if self.pipeline.max_parallel_preparation == 0 {
            return Err(invalid("pipeline.max_parallel_preparation", "must be at least 1"));
        }
        if self.pipeline.checkpoint_every == 0 {
            return Err(invalid("pipeline.checkpoint_every", "must be at least 1"));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/transcriptor/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("transcriptor")
            .join("config.toml")
    }

    /// Root directory for ledger, logs, checkpoints and work files.
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("transcriptor"))
            .unwrap_or_else(|| PathBuf::from(".transcriptor"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("ledger.json"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.supervisor
            .log_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("logs").join("jobs"))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.pipeline
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("checkpoints"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.pipeline
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("transcriptor"))
    }
}

fn invalid(key: &str, message: &str) -> TranscriptorError {
    TranscriptorError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
