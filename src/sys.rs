//! Safe wrappers for platform-specific unsafe operations.
//!
//! Every `unsafe` block in the codebase lives here. Call sites use the safe
//! public API and never touch `unsafe` directly.

/// Signals the supervisor sends to processes it owns or reclaims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination request (SIGTERM)
    Terminate,
    /// Forced termination (SIGKILL)
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Outcome of delivering a signal to a pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// ESRCH: the process is already gone
    NoSuchProcess,
    /// EPERM: the process exists but belongs to someone else
    PermissionDenied,
    Failed(String),
}

/// Send `signal` to `pid`.
///
/// Pids that do not fit a positive `pid_t` are reported as `NoSuchProcess`
/// so that a corrupt ledger row can never signal a process group.
pub fn send_signal(pid: u32, signal: Signal) -> SignalOutcome {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return SignalOutcome::NoSuchProcess;
    };
    if raw_pid <= 0 {
        return SignalOutcome::NoSuchProcess;
    }
    // SAFETY: kill(2) has no memory-safety preconditions; pid is a positive
    // value so it addresses exactly one process.
    let rc = unsafe { libc::kill(raw_pid, signal.as_raw()) };
    if rc == 0 {
        return SignalOutcome::Delivered;
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => SignalOutcome::NoSuchProcess,
        Some(libc::EPERM) => SignalOutcome::PermissionDenied,
        _ => SignalOutcome::Failed(err.to_string()),
    }
}

/// Return true if a process with `pid` exists (it may be a zombie).
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw_pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(raw_pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Pid of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Exclusive advisory lock on a file, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: std::fs::File,
}

impl FileLock {
    /// Block until an exclusive `flock(2)` on `path` is held, creating the
    /// file if needed.
    pub fn acquire(path: &std::path::Path) -> std::io::Result<Self> {
        use std::os::fd::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        loop {
            // SAFETY: the descriptor is owned by `file` and stays open for
            // the duration of the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { _file: file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Set an environment variable.
///
/// # Safety
/// Caller must ensure no other threads are reading environment variables concurrently.
pub fn set_env(key: &str, value: &str) {
    // SAFETY: Caller must ensure no other threads are reading environment
    // variables concurrently.
    #[allow(unsafe_code)]
    unsafe {
        std::env::set_var(key, value);
    }
}

/// Remove an environment variable.
///
/// # Safety
/// Caller must ensure no other threads are reading environment variables concurrently.
pub fn remove_env(key: &str) {
    // SAFETY: Caller must ensure no other threads are reading environment
    // variables concurrently.
    #[allow(unsafe_code)]
    unsafe {
        std::env::remove_var(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn current_process_exists() {
        assert!(process_exists(current_pid()));
    }

    #[test]
    fn zero_pid_is_never_signalled() {
        assert_eq!(send_signal(0, Signal::Terminate), SignalOutcome::NoSuchProcess);
        assert!(!process_exists(0));
    }

    #[test]
    fn oversized_pid_is_rejected() {
        assert_eq!(
            send_signal(u32::MAX, Signal::Kill),
            SignalOutcome::NoSuchProcess
        );
    }

    #[test]
    fn terminate_running_child() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id();
        assert_eq!(send_signal(pid, Signal::Terminate), SignalOutcome::Delivered);
        let status = child.wait().expect("wait for sleep");
        assert!(!status.success());
    }

    #[test]
    fn reaped_child_reports_no_such_process() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait for true");
        // The pid could in theory be reused, but not within this window on
        // any realistic test host.
        assert_eq!(send_signal(pid, Signal::Terminate), SignalOutcome::NoSuchProcess);
    }

    #[test]
    fn file_lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.lock");
        {
            let _lock = FileLock::acquire(&path).expect("first lock");
        }
        let _again = FileLock::acquire(&path).expect("second lock");
        assert!(path.exists());
    }

    #[test]
    fn set_env_and_read_back() {
        let _guard = ENV_LOCK.lock().expect("ENV_LOCK poisoned");
        const KEY: &str = "TRANSCRIPTOR_SYS_TEST_VAR";
        set_env(KEY, "hello");
        assert_eq!(std::env::var(KEY).expect("var should be set"), "hello");
        remove_env(KEY);
        assert!(std::env::var(KEY).is_err());
    }
}
