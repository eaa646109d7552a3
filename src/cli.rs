//! Command-line interface for transcriptor
//!
//! Provides argument parsing using clap derive macros.

use crate::config::LaneMode;
use crate::ledger::JobStatus;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Chunked long-audio transcription with supervised workers
#[derive(Parser, Debug)]
#[command(name = "transcriptor", version, about = "Chunked long-audio transcription with supervised workers")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug logs, -vv: trace logs)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime` (`5s`, `1m`,
/// `1h30m`); a bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse::<JobStatus>().map_err(|e| e.to_string())
}

/// Per-job overrides of the configured engine, pool and chunking.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct JobOverrides {
    /// Engine model identity
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Language hint for the engine (auto, en, th, ...)
    #[arg(long, value_name = "LANG")]
    pub language: Option<String>,

    /// Process-level lanes (P)
    #[arg(long, short = 'p', value_name = "N")]
    pub processes: Option<usize>,

    /// Threads per lane (T)
    #[arg(long, short = 't', value_name = "N")]
    pub threads: Option<usize>,

    /// Core window length in seconds
    #[arg(long, value_name = "SECONDS")]
    pub window: Option<f64>,

    /// Overlap padding in seconds
    #[arg(long, value_name = "SECONDS")]
    pub overlap: Option<f64>,
}

/// Lane hosting selectable on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneArg {
    InProcess,
    Subprocess,
}

impl From<LaneArg> for LaneMode {
    fn from(arg: LaneArg) -> Self {
        match arg {
            LaneArg::InProcess => LaneMode::InProcess,
            LaneArg::Subprocess => LaneMode::Subprocess,
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor daemon (dispatches pending jobs)
    Supervise {
        /// Ledger poll interval (e.g., 500ms, 2s)
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        poll_interval: Option<Duration>,

        /// Jobs run at the same time
        #[arg(long, value_name = "N")]
        max_active: Option<usize>,
    },

    /// Add a job to the ledger for the daemon to pick up
    Submit {
        /// Input audio file
        input: PathBuf,

        /// Output path (artifacts get .txt/.json/.srt), default: next to input
        #[arg(long, short = 'o', value_name = "PATH")]
        output: Option<PathBuf>,

        #[command(flatten)]
        overrides: JobOverrides,
    },

    /// Run one ledger job in this process
    RunJob {
        /// Ledger job id
        #[arg(long, value_name = "ID")]
        job_id: u64,

        /// Lane hosting (default: from config)
        #[arg(long, value_enum)]
        lanes: Option<LaneArg>,
    },

    /// Transcribe several files in this process, overlapping preparation and transcription
    Batch {
        /// Input audio files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Directory for artifacts (default: next to each input)
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Files prepared at the same time
        #[arg(long, value_name = "N")]
        parallel_preparation: Option<usize>,

        /// Lane hosting (default: from config)
        #[arg(long, value_enum)]
        lanes: Option<LaneArg>,

        /// Keep prepared chunk files
        #[arg(long)]
        keep_work_dir: bool,

        /// Print the outcome of every job as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        overrides: JobOverrides,
    },

    /// Run one pool lane from a manifest (started by the pool)
    #[command(hide = true)]
    Worker {
        /// Lane manifest written by the parent
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,
    },

    /// Inspect and manage ledger jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Show the output of a job's process
    Logs {
        /// Ledger job id
        job_id: u64,

        /// Number of trailing lines
        #[arg(long, short = 'n', value_name = "N", default_value = "50")]
        lines: usize,
    },

    /// Check external tools (ffmpeg, ffprobe, engine)
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Ledger job actions
#[derive(Subcommand, Debug)]
pub enum JobsAction {
    /// List jobs
    List {
        /// Only jobs in this state (pending, processing, completed, failed, cancelled)
        #[arg(long, value_name = "STATUS", value_parser = parse_status)]
        status: Option<JobStatus>,

        /// Show only the most recent N jobs
        #[arg(long, value_name = "N")]
        limit: Option<usize>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one job
    Show {
        job_id: u64,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a pending or running job
    Cancel { job_id: u64 },
    /// Remove a finished job from the ledger
    Delete {
        job_id: u64,

        /// Delete even if the job is still pending or processing
        #[arg(long)]
        force: bool,
    },
    /// Counts per status and success rate
    Stats,
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verbose_repeated_flags() {
        let cli = Cli::try_parse_from(["transcriptor", "-v", "-v", "check"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Check { json: false }));
    }

    #[test]
    fn test_parse_submit_with_overrides() {
        let cli = Cli::try_parse_from([
            "transcriptor",
            "submit",
            "talk.mp3",
            "-o",
            "out/talk",
            "--model",
            "large-v3",
            "-p",
            "3",
            "-t",
            "4",
            "--window",
            "25",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit {
                input,
                output,
                overrides,
            } => {
                assert_eq!(input, PathBuf::from("talk.mp3"));
                assert_eq!(output, Some(PathBuf::from("out/talk")));
                assert_eq!(overrides.model.as_deref(), Some("large-v3"));
                assert_eq!(overrides.processes, Some(3));
                assert_eq!(overrides.threads, Some(4));
                assert_eq!(overrides.window, Some(25.0));
                assert_eq!(overrides.overlap, None);
            }
            other => panic!("Expected Submit, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_job() {
        let cli =
            Cli::try_parse_from(["transcriptor", "run-job", "--job-id", "12", "--lanes", "in-process"])
                .unwrap();
        match cli.command {
            Commands::RunJob { job_id, lanes } => {
                assert_eq!(job_id, 12);
                assert_eq!(lanes, Some(LaneArg::InProcess));
            }
            other => panic!("Expected RunJob, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_requires_inputs() {
        assert!(Cli::try_parse_from(["transcriptor", "batch"]).is_err());
        let cli = Cli::try_parse_from(["transcriptor", "batch", "a.wav", "b.wav", "--json"]).unwrap();
        match cli.command {
            Commands::Batch { inputs, json, .. } => {
                assert_eq!(inputs.len(), 2);
                assert!(json);
            }
            other => panic!("Expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_jobs_list_status() {
        let cli =
            Cli::try_parse_from(["transcriptor", "jobs", "list", "--status", "failed", "--limit", "5"])
                .unwrap();
        match cli.command {
            Commands::Jobs {
                action: JobsAction::List { status, limit, json },
            } => {
                assert_eq!(status, Some(JobStatus::Failed));
                assert_eq!(limit, Some(5));
                assert!(!json);
            }
            other => panic!("Expected Jobs List, got {other:?}"),
        }
        assert!(Cli::try_parse_from(["transcriptor", "jobs", "list", "--status", "running"]).is_err());
    }

    #[test]
    fn test_parse_supervise_durations() {
        let cli =
            Cli::try_parse_from(["transcriptor", "supervise", "--poll-interval", "500ms"]).unwrap();
        match cli.command {
            Commands::Supervise { poll_interval, .. } => {
                assert_eq!(poll_interval, Some(Duration::from_millis(500)));
            }
            other => panic!("Expected Supervise, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_duration_formats() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_worker_is_hidden() {
        let help = Cli::command().render_help().to_string();
        assert!(!help.lines().any(|line| line.trim_start().starts_with("worker")));
        assert!(Cli::try_parse_from(["transcriptor", "worker", "--manifest", "m.json"]).is_ok());
    }

    #[test]
    fn test_parse_logs_default_lines() {
        let cli = Cli::try_parse_from(["transcriptor", "logs", "4"]).unwrap();
        match cli.command {
            Commands::Logs { job_id, lines } => {
                assert_eq!(job_id, 4);
                assert_eq!(lines, 50);
            }
            other => panic!("Expected Logs, got {other:?}"),
        }
    }
}
