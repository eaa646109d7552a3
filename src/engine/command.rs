//! Engine driven as an external program.
//!
//! The program is invoked once per chunk as
//! `<command> <args...> --model <model> --language <lang> <file>` and is
//! expected to print `{"text": "...", "segments": [...]}` on stdout. Plain
//! text output is accepted as a transcript without segments.

use crate::cancel::CancelToken;
use crate::command::run_command_cancellable;
use crate::config::EngineConfig;
use crate::engine::transcriber::{ChunkTranscript, EngineFactory, Transcriber};
use crate::error::Result;
use std::path::Path;

/// Runs the configured engine program for every chunk.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    model: String,
    cancel: CancelToken,
}

impl CommandTranscriber {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            model: config.model.clone(),
            cancel: CancelToken::new(),
        }
    }

    /// Kill in-flight engine runs when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn arguments(&self, audio: &Path, language: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--model".to_string(),
            self.model.clone(),
            "--language".to_string(),
            language.to_string(),
            audio.to_string_lossy().into_owned(),
        ]);
        args
    }
}

impl Transcriber for CommandTranscriber {
    fn transcribe(&self, audio: &Path, language: &str) -> Result<ChunkTranscript> {
        let args = self.arguments(audio, language);
        let output = run_command_cancellable(&self.program, &args, None, &self.cancel, None)?;
        Ok(parse_engine_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn is_ready(&self) -> bool {
        !self.program.is_empty()
    }
}

/// Parse engine stdout, falling back to raw text when it is not JSON.
pub fn parse_engine_output(stdout: &str) -> ChunkTranscript {
    let trimmed = stdout.trim();
    match serde_json::from_str::<ChunkTranscript>(trimmed) {
        Ok(mut transcript) => {
            transcript.text = transcript.text.trim().to_string();
            transcript
        }
        Err(_) => ChunkTranscript {
            text: trimmed.to_string(),
            segments: Vec::new(),
        },
    }
}

/// Hands every lane its own [`CommandTranscriber`].
#[derive(Debug, Clone)]
pub struct CommandEngineFactory {
    config: EngineConfig,
    cancel: CancelToken,
}

impl CommandEngineFactory {
    pub fn new(config: EngineConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }
}

impl EngineFactory for CommandEngineFactory {
    fn load(&self, lane: usize) -> Result<Box<dyn Transcriber>> {
        tracing::debug!(lane, command = %self.config.command, model = %self.config.model, "engine ready");
        Ok(Box::new(
            CommandTranscriber::new(&self.config).with_cancel(self.cancel.clone()),
        ))
    }

    fn model_name(&self) -> String {
        self.config.model.clone()
    }
}
