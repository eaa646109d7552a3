use crate::chunking::TimedSegment;
use crate::error::{Result, TranscriptorError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Text and chunk-local timed segments produced for one audio file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkTranscript {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TimedSegment>,
}

/// Trait for speech-to-text transcription of a chunk file.
///
/// Implementations are not assumed to be safe for concurrent calls; the
/// worker pool serializes calls on each instance.
pub trait Transcriber: Send {
    /// Transcribe one audio file.
    ///
    /// # Arguments
    /// * `audio` - Chunk audio file
    /// * `language` - Language hint, `"auto"` for detection
    fn transcribe(&self, audio: &Path, language: &str) -> Result<ChunkTranscript>;

    /// Get the name of the loaded model
    fn model_name(&self) -> &str;

    /// Check if the transcriber is ready
    fn is_ready(&self) -> bool;
}

/// Loads one engine instance per pool lane.
pub trait EngineFactory: Send + Sync {
    fn load(&self, lane: usize) -> Result<Box<dyn Transcriber>>;

    /// Engine identity reported in artifacts
    fn model_name(&self) -> String;
}

/// Call log shared by every clone of a [`MockTranscriber`].
#[derive(Debug, Default)]
struct MockCalls {
    count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    files: Mutex<Vec<String>>,
}

/// Mock transcriber for testing
///
/// Responds with `"<prefix> <file stem>"` unless a response is registered
/// for the stem. Clones share the call log.
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    model_name: String,
    prefix: String,
    responses: HashMap<String, ChunkTranscript>,
    failing: HashSet<String>,
    delay: Duration,
    should_fail: bool,
    calls: Arc<MockCalls>,
}

impl MockTranscriber {
    /// Create a new mock transcriber with default settings
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            prefix: "mock transcription of".to_string(),
            responses: HashMap::new(),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            should_fail: false,
            calls: Arc::new(MockCalls::default()),
        }
    }

    /// Configure the text returned for a chunk file stem (`chunk_001`)
    pub fn with_response(mut self, stem: &str, text: &str) -> Self {
        self.responses.insert(
            stem.to_string(),
            ChunkTranscript {
                text: text.to_string(),
                segments: vec![TimedSegment {
                    start: 0.0,
                    end: 1.0,
                    text: text.to_string(),
                }],
            },
        );
        self
    }

    /// Configure the mock to fail for one chunk file stem
    pub fn with_failing_chunk(mut self, stem: &str) -> Self {
        self.failing.insert(stem.to_string());
        self
    }

    /// Configure the mock to fail on every call
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Sleep for `delay` inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `transcribe` calls across all clones
    pub fn call_count(&self) -> usize {
        self.calls.count.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed
    pub fn max_concurrent_calls(&self) -> usize {
        self.calls.max_in_flight.load(Ordering::SeqCst)
    }

    /// File stems transcribed so far, in call order
    pub fn transcribed_files(&self) -> Vec<String> {
        self.calls
            .files
            .lock()
            .map(|files| files.clone())
            .unwrap_or_default()
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, audio: &Path, _language: &str) -> Result<ChunkTranscript> {
        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.calls.count.fetch_add(1, Ordering::SeqCst);
        let now = self.calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut files) = self.calls.files.lock() {
            files.push(stem.clone());
        }

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.calls.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail || self.failing.contains(&stem) {
            return Err(TranscriptorError::Other(format!(
                "mock transcription failure for {stem}"
            )));
        }

        Ok(self.responses.get(&stem).cloned().unwrap_or_else(|| {
            let text = format!("{} {}", self.prefix, stem);
            ChunkTranscript {
                segments: vec![TimedSegment {
                    start: 0.0,
                    end: 1.0,
                    text: text.clone(),
                }],
                text,
            }
        }))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        !self.should_fail
    }
}

/// Factory handing every lane a clone of one mock, so tests can inspect
/// the combined call log.
#[derive(Debug, Clone)]
pub struct MockEngineFactory {
    mock: MockTranscriber,
    failing_lanes: HashSet<usize>,
}

impl MockEngineFactory {
    pub fn new(mock: MockTranscriber) -> Self {
        Self {
            mock,
            failing_lanes: HashSet::new(),
        }
    }

    /// Make engine loading fail for `lane`
    pub fn with_failing_lane(mut self, lane: usize) -> Self {
        self.failing_lanes.insert(lane);
        self
    }

    pub fn mock(&self) -> &MockTranscriber {
        &self.mock
    }
}

impl EngineFactory for MockEngineFactory {
    fn load(&self, lane: usize) -> Result<Box<dyn Transcriber>> {
        if self.failing_lanes.contains(&lane) {
            return Err(TranscriptorError::EngineLoad {
                message: format!("mock engine refused to load on lane {lane}"),
            });
        }
        Ok(Box::new(self.mock.clone()))
    }

    fn model_name(&self) -> String {
        self.mock.model_name.clone()
    }
}
