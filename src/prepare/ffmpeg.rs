//! Preparation through `ffprobe` and `ffmpeg`.

use crate::cancel::CancelToken;
use crate::chunking::{ChunkDescriptor, ChunkPlanner};
use crate::command::run_command_cancellable;
use crate::config::ChunkingConfig;
use crate::defaults;
use crate::error::{Result, TranscriptorError};
use crate::prepare::{PreparedAudio, Preparer};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const ENHANCED_FILE: &str = "enhanced.wav";
const CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
const ENHANCE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Real preparation stage.
#[derive(Debug, Clone)]
pub struct FfmpegPreparer {
    planner: ChunkPlanner,
    enhance: bool,
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegPreparer {
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        Ok(Self {
            planner: ChunkPlanner::new(config.window_secs, config.overlap_secs)?,
            enhance: config.enhance,
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        })
    }

    /// Use specific tool binaries instead of the ones on `PATH`.
    pub fn with_tools(mut self, ffmpeg: &str, ffprobe: &str) -> Self {
        self.ffmpeg = ffmpeg.to_string();
        self.ffprobe = ffprobe.to_string();
        self
    }

    /// Duration of `input` in seconds.
    ///
    /// PCM WAV headers are read directly; everything else goes through
    /// `ffprobe`.
    pub fn probe_duration(&self, input: &Path, cancel: &CancelToken) -> Result<f64> {
        if is_wav(input)
            && let Some(duration) = wav_duration(input)
        {
            return Ok(duration);
        }

        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            input.to_string_lossy().into_owned(),
        ];
        let output = run_command_cancellable(&self.ffprobe, &args, None, cancel, Some(CHUNK_TIMEOUT))
            .map_err(stage_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_duration(&stdout).ok_or_else(|| TranscriptorError::PreparationFailed {
            message: format!(
                "could not read duration of {} from ffprobe output {:?}",
                input.display(),
                stdout.trim()
            ),
        })
    }

    fn enhance_into(&self, input: &Path, output: &Path, cancel: &CancelToken) -> Result<()> {
        let args = vec![
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-af".to_string(),
            enhancement_filter(),
            "-ar".to_string(),
            defaults::SAMPLE_RATE.to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            "-y".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        run_command_cancellable(&self.ffmpeg, &args, None, cancel, Some(ENHANCE_TIMEOUT))
            .map_err(stage_error)?;
        Ok(())
    }

    fn extract(&self, source: &Path, chunk: &ChunkDescriptor, cancel: &CancelToken) -> Result<()> {
        let mut args = vec![
            "-i".to_string(),
            source.to_string_lossy().into_owned(),
            "-ss".to_string(),
            format!("{:.3}", chunk.padded_start),
            "-t".to_string(),
            format!("{:.3}", chunk.padded_duration()),
        ];
        args.extend(codec_args(&chunk.file).iter().map(|a| a.to_string()));
        args.push("-y".to_string());
        args.push(chunk.file.to_string_lossy().into_owned());

        run_command_cancellable(&self.ffmpeg, &args, None, cancel, Some(CHUNK_TIMEOUT)).map_err(
            |e| match e {
                TranscriptorError::Cancelled => e,
                other => TranscriptorError::PreparationFailed {
                    message: format!("failed to create {}: {}", chunk.key(), other),
                },
            },
        )?;
        Ok(())
    }
}

impl Preparer for FfmpegPreparer {
    fn prepare(&self, input: &Path, work_dir: &Path, cancel: &CancelToken) -> Result<PreparedAudio> {
        if !input.is_file() {
            return Err(TranscriptorError::PreparationFailed {
                message: format!("input file not found: {}", input.display()),
            });
        }
        std::fs::create_dir_all(work_dir)?;
        let started = Instant::now();

        let source: PathBuf = if self.enhance {
            let enhanced = work_dir.join(ENHANCED_FILE);
            self.enhance_into(input, &enhanced, cancel)?;
            enhanced
        } else {
            input.to_path_buf()
        };

        let duration = self.probe_duration(&source, cancel)?;
        let extension = if is_wav(&source) { "wav" } else { "mp3" };
        let chunks_dir = work_dir.join("chunks");
        std::fs::create_dir_all(&chunks_dir)?;
        let chunks = self.planner.plan_in(duration, &chunks_dir, extension);
        if chunks.is_empty() {
            return Err(TranscriptorError::PreparationFailed {
                message: format!("{} contains no audio", input.display()),
            });
        }

        for chunk in &chunks {
            cancel.checkpoint()?;
            self.extract(&source, chunk, cancel)?;
        }

        let prepared = PreparedAudio {
            duration,
            window_secs: self.planner.window_secs(),
            overlap_secs: self.planner.overlap_secs(),
            chunks,
        };
        prepared.write_metadata(&chunks_dir)?;

        tracing::info!(
            input = %input.display(),
            duration_secs = duration,
            chunks = prepared.chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "prepared"
        );
        Ok(prepared)
    }
}

/// Filter chain applied when enhancement is enabled.
pub fn enhancement_filter() -> String {
    "highpass=f=200,lowpass=f=3000,loudnorm=I=-16:TP=-1.5:LRA=11".to_string()
}

fn codec_args(chunk_file: &Path) -> &'static [&'static str] {
    if is_wav(chunk_file) {
        &["-c", "copy"]
    } else {
        &["-c:a", "libmp3lame", "-b:a", "128k"]
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"))
}

fn wav_duration(path: &Path) -> Option<f64> {
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(f64::from(reader.duration()) / f64::from(spec.sample_rate))
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .find(|d| d.is_finite() && *d > 0.0)
}

fn stage_error(error: TranscriptorError) -> TranscriptorError {
    match error {
        TranscriptorError::Cancelled => error,
        other => TranscriptorError::PreparationFailed {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, seconds: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(16000 * seconds) {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_duration_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 3);
        assert_eq!(wav_duration(&path), Some(3.0));

        let preparer = FfmpegPreparer::new(&ChunkingConfig::default())
            .unwrap()
            .with_tools("ffmpeg", "transcriptor-missing-ffprobe");
        // The header fast path never invokes ffprobe
        let duration = preparer.probe_duration(&path, &CancelToken::new()).unwrap();
        assert_eq!(duration, 3.0);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("63.000000\n"), Some(63.0));
        assert_eq!(parse_duration("N/A\n12.5\n"), Some(12.5));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("0.0"), None);
    }

    #[test]
    fn test_codec_args_follow_extension() {
        assert_eq!(codec_args(Path::new("chunk_001.wav")), &["-c", "copy"]);
        assert_eq!(codec_args(Path::new("chunk_001.mp3"))[1], "libmp3lame");
    }

    #[test]
    fn test_enhancement_filter_chain() {
        let filter = enhancement_filter();
        assert!(filter.starts_with("highpass=f=200,lowpass=f=3000"));
        assert!(filter.contains("loudnorm=I=-16"));
    }

    #[test]
    fn test_missing_input_is_preparation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let preparer = FfmpegPreparer::new(&ChunkingConfig::default()).unwrap();
        let err = preparer
            .prepare(&dir.path().join("absent.wav"), dir.path(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TranscriptorError::PreparationFailed { .. }));
    }

    #[test]
    fn test_missing_tool_is_preparation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("talk.m4a");
        std::fs::write(&input, b"not really audio").unwrap();
        let config = ChunkingConfig {
            enhance: false,
            ..ChunkingConfig::default()
        };
        let preparer = FfmpegPreparer::new(&config)
            .unwrap()
            .with_tools("transcriptor-missing-ffmpeg", "transcriptor-missing-ffprobe");
        let err = preparer
            .prepare(&input, &dir.path().join("work"), &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("transcriptor-missing-ffprobe"));
    }
}
