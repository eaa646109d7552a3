//! Tracing subscriber setup for the binary.
//!
//! `TRANSCRIPTOR_LOG` takes an `EnvFilter` directive and wins over `-v`.
//! Output goes to stderr so that stdout stays free for command output and
//! for the `@chunk` lines of lane workers.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "TRANSCRIPTOR_LOG";

/// Filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "transcriptor=info",
        1 => "transcriptor=debug",
        _ => "transcriptor=trace",
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(verbosity: u8, quiet: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        if quiet {
            EnvFilter::new("transcriptor=warn")
        } else {
            EnvFilter::new(default_directive(verbosity))
        }
    });

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init(0, false);
        init(2, true);
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(default_directive(0), "transcriptor=info");
        assert_eq!(default_directive(1), "transcriptor=debug");
        assert_eq!(default_directive(5), "transcriptor=trace");
    }
}
