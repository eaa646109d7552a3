//! Startup capability check.
//!
//! Verifies that the preparation tools and the engine command can be run
//! before any job is accepted.

use crate::command::probe_version;
use crate::config::Config;
use crate::error::TranscriptorError;
use serde::Serialize;

/// Whether an external tool can be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Availability {
    /// Tool ran and reported a version line
    Available { version: String },
    /// Tool is not on `PATH`
    Missing,
    /// Tool exists but could not report a version
    Broken { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available { .. })
    }
}

/// One probed tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCheck {
    pub name: String,
    pub command: String,
    pub availability: Availability,
}

/// Result of [`probe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityReport {
    pub ffmpeg: ToolCheck,
    pub ffprobe: ToolCheck,
    pub engine: ToolCheck,
}

impl CapabilityReport {
    pub fn tools(&self) -> [&ToolCheck; 3] {
        [&self.ffmpeg, &self.ffprobe, &self.engine]
    }

    /// True when every tool is available.
    pub fn is_ready(&self) -> bool {
        self.tools().iter().all(|tool| tool.availability.is_available())
    }
}

/// Probe one command with a version flag.
pub fn check_command(command: &str, flag: &str) -> Availability {
    match probe_version(command, flag) {
        Ok(version) if version.is_empty() => Availability::Broken {
            reason: format!("'{command} {flag}' printed nothing"),
        },
        Ok(version) => Availability::Available { version },
        Err(TranscriptorError::CommandMissing { .. }) => Availability::Missing,
        Err(e) => Availability::Broken {
            reason: e.to_string(),
        },
    }
}

/// Probe the preparation tools and the configured engine command.
pub fn probe(config: &Config) -> CapabilityReport {
    let report = CapabilityReport {
        ffmpeg: ToolCheck {
            name: "ffmpeg".to_string(),
            command: "ffmpeg".to_string(),
            availability: check_command("ffmpeg", "-version"),
        },
        ffprobe: ToolCheck {
            name: "ffprobe".to_string(),
            command: "ffprobe".to_string(),
            availability: check_command("ffprobe", "-version"),
        },
        engine: ToolCheck {
            name: "engine".to_string(),
            command: config.engine.command.clone(),
            availability: check_command(&config.engine.command, "--version"),
        },
    };
    for tool in report.tools() {
        match &tool.availability {
            Availability::Available { version } => {
                tracing::debug!(tool = %tool.name, %version, "tool available");
            }
            Availability::Missing => tracing::warn!(tool = %tool.name, command = %tool.command, "tool not found"),
            Availability::Broken { reason } => {
                tracing::warn!(tool = %tool.name, command = %tool.command, %reason, "tool unusable");
            }
        }
    }
    report
}

/// Print the report the way `transcriptor check` shows it.
pub fn print_report(report: &CapabilityReport) {
    println!("Checking external tools...\n");
    for tool in report.tools() {
        print!("{} ({}): ", tool.name, tool.command);
        match &tool.availability {
            Availability::Available { version } => println!("✓ OK ({version})"),
            Availability::Missing => println!("✗ NOT FOUND"),
            Availability::Broken { reason } => println!("⚠ BROKEN: {reason}"),
        }
    }
    println!();
    if report.is_ready() {
        println!("All tools available.");
    } else {
        println!("Some tools are missing; jobs needing them will fail.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command() {
        assert_eq!(
            check_command("transcriptor-no-such-tool-xyz", "--version"),
            Availability::Missing
        );
    }

    #[test]
    fn test_available_command() {
        match check_command("sh", "-c") {
            // `sh -c` without a script fails, which counts as broken
            Availability::Broken { .. } => {}
            other => panic!("unexpected availability: {other:?}"),
        }
        match check_command("echo", "tool 1.2.3") {
            Availability::Available { version } => assert_eq!(version, "tool 1.2.3"),
            other => panic!("unexpected availability: {other:?}"),
        }
    }

    #[test]
    fn test_report_readiness() {
        let mut config = Config::default();
        config.engine.command = "transcriptor-no-such-engine".to_string();
        let report = probe(&config);
        assert_eq!(report.engine.availability, Availability::Missing);
        assert!(!report.is_ready());
    }

    #[test]
    fn test_availability_json() {
        let json = serde_json::to_string(&Availability::Available {
            version: "6.1".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"available","version":"6.1"}"#);
    }
}
