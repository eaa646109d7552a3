//! Blocking execution of short-lived external tools.
//!
//! Used for `ffprobe`/`ffmpeg` and the per-chunk engine command. Long-lived
//! supervised processes go through [`crate::supervisor`] instead.

use crate::cancel::CancelToken;
use crate::error::{Result, TranscriptorError};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `program` to completion, killing it when `cancel` fires or
/// `hard_timeout` elapses.
///
/// A non-zero exit becomes `CommandFailed` carrying the tail of stderr.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    cancel: &CancelToken,
    hard_timeout: Option<Duration>,
) -> Result<Output> {
    cancel.checkpoint()?;

    let rendered = render(program, args);
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| spawn_error(program, e))?;
    let started_at = Instant::now();
    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx.recv_timeout(PIPE_DRAIN_TIMEOUT).unwrap_or_default();
            let stderr = stderr_rx.recv_timeout(PIPE_DRAIN_TIMEOUT).unwrap_or_default();
            return validate_command_output(
                &rendered,
                Output {
                    status,
                    stdout,
                    stderr,
                },
            );
        }

        if cancel.is_cancelled() {
            tracing::debug!(command = %rendered, "cancelled, killing child");
            terminate(&mut child);
            return Err(TranscriptorError::Cancelled);
        }

        if let Some(limit) = hard_timeout
            && started_at.elapsed() >= limit
        {
            tracing::warn!(command = %rendered, timeout_ms = limit.as_millis() as u64, "command timed out");
            terminate(&mut child);
            return Err(TranscriptorError::CommandTimeout {
                command: rendered,
                timeout_ms: limit.as_millis().try_into().unwrap_or(u64::MAX),
            });
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Run `program` without cancellation or timeout.
pub fn run_command(program: &str, args: &[String]) -> Result<Output> {
    run_command_cancellable(program, args, None, &CancelToken::new(), None)
}

/// First line of `program --version` (or `-version` for ffmpeg-style tools).
pub fn probe_version(program: &str, flag: &str) -> Result<String> {
    let output = run_command_cancellable(
        program,
        &[flag.to_string()],
        None,
        &CancelToken::new(),
        Some(Duration::from_secs(10)),
    )?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string())
}

fn validate_command_output(rendered: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let status = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(TranscriptorError::from_command_failure(
        rendered.to_string(),
        status,
        stderr,
    ))
}

fn spawn_error(program: &str, error: std::io::Error) -> TranscriptorError {
    if error.kind() == std::io::ErrorKind::NotFound {
        TranscriptorError::CommandMissing {
            command: program.to_string(),
        }
    } else {
        TranscriptorError::ProcessSpawn {
            command: program.to_string(),
            message: error.to_string(),
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if pipe.read_to_end(&mut buf).is_ok() {
                tx.send(buf).ok();
            }
        });
    }
    rx
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "kill after exit");
    }
    if let Err(e) = child.wait() {
        tracing::debug!(error = %e, "wait after kill failed");
    }
}

pub(crate) fn render(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
