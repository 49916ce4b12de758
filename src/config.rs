//! Runtime configuration.
//!
//! Deserialized from TOML via `serde`, with typed defaults so a partial
//! config file only needs to name the fields it overrides. [`RuntimeConfig::validate`]
//! enforces the ranges named in the data model before anything else touches
//! the config — out-of-range values fail fast with
//! [`crate::error::InvalidInputError::Configuration`] rather than surfacing
//! as a confusing failure deep in the pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppError, InvalidInputError};

/// Top-level configuration for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Voice activity detection and conversation pacing settings.
    pub pipeline: PipelineConfig,
    /// Language model generation defaults.
    pub llm: LlmConfig,
    /// Text-to-speech defaults.
    pub tts: TtsConfig,
    /// Model store / download settings.
    pub storage: StorageConfig,
    /// Memory pressure supervisor settings.
    pub pressure: PressureConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            pipeline: PipelineConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            storage: StorageConfig::default(),
            pressure: PressureConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load a config from a TOML file, falling back to defaults for any
    /// field the file omits, then validate the result.
    pub fn load(path: &std::path::Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(crate::error::IoError::Disk)?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            AppError::InvalidInput(InvalidInputError::Configuration(e.to_string()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all range-constrained fields, matching the data model
    /// invariants for `PipelineConfig`.
    pub fn validate(&self) -> Result<(), AppError> {
        self.pipeline.validate()?;
        self.tts.validate()
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input sample rate in Hz, as delivered by the capture device.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
    /// Number of input channels (1 = mono).
    pub input_channels: u16,
    /// Audio buffer size in frames.
    pub buffer_size: u32,
    /// Input device name (`None` = system default).
    pub input_device: Option<String>,
    /// Output device name (`None` = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            input_channels: 1,
            buffer_size: 512,
            input_device: None,
            output_device: None,
        }
    }
}

/// Voice-activity and conversation pacing configuration. Mirrors `PipelineConfig`
/// in the data model exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Voice activity threshold, normalized 0.0–1.0, mapped to a 6–24 dB gain.
    pub vad_threshold: f32,
    /// Minimum speech segment length, in milliseconds, to avoid being discarded.
    pub min_speech_ms: u32,
    /// Silence duration, in milliseconds, that closes an open speech segment.
    pub silence_timeout_ms: u32,
    /// Whether a new voiced segment during `Thinking`/`Speaking` interrupts them.
    pub enable_barge_in: bool,
    /// Maximum number of conversation turns retained in history.
    pub max_history_turns: u32,
    /// Maximum tokens the LLM may generate for one turn.
    pub llm_max_tokens: u32,
    /// TTS voice identifier to use, if the backend supports multiple voices.
    pub tts_voice_id: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.5,
            min_speech_ms: 250,
            silence_timeout_ms: 800,
            enable_barge_in: true,
            max_history_turns: 32,
            llm_max_tokens: 512,
            tts_voice_id: None,
        }
    }
}

impl PipelineConfig {
    /// Validate against the ranges fixed by the data model.
    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(InvalidInputError::Configuration(format!(
                "vad_threshold must be in [0.0, 1.0], got {}",
                self.vad_threshold
            ))
            .into());
        }
        if self.min_speech_ms < 50 {
            return Err(InvalidInputError::Configuration(format!(
                "min_speech_ms must be >= 50, got {}",
                self.min_speech_ms
            ))
            .into());
        }
        if self.silence_timeout_ms < 100 {
            return Err(InvalidInputError::Configuration(format!(
                "silence_timeout_ms must be >= 100, got {}",
                self.silence_timeout_ms
            ))
            .into());
        }
        Ok(())
    }
}

/// Language model generation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// First-token timeout, in seconds, before the generation is cancelled.
    pub first_token_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            first_token_timeout_secs: 120,
        }
    }
}

/// Text-to-speech defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Playback speed multiplier.
    pub speed: f32,
    /// Pitch shift in semitones.
    pub pitch_semitones: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch_semitones: 0.0,
        }
    }
}

impl TtsConfig {
    /// Validate against the ranges fixed by the Engine Facade contract.
    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.5..=2.0).contains(&self.speed) {
            return Err(InvalidInputError::Configuration(format!(
                "tts speed must be in [0.5, 2.0], got {}",
                self.speed
            ))
            .into());
        }
        if !(-12.0..=12.0).contains(&self.pitch_semitones) {
            return Err(InvalidInputError::Configuration(format!(
                "tts pitch_semitones must be in [-12, 12], got {}",
                self.pitch_semitones
            ))
            .into());
        }
        Ok(())
    }
}

/// Model store and download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for downloaded model files and the registry manifest.
    pub cache_dir: Option<PathBuf>,
    /// Directory for the rotating log file sink. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Maximum concurrent downloads.
    pub max_concurrent_downloads: usize,
    /// Maximum retry attempts for a transient download failure.
    pub max_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_dir: None,
            max_concurrent_downloads: 2,
            max_retries: 3,
        }
    }
}

/// Memory pressure supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Resident-memory limit in bytes. `0` means "never pressured".
    pub limit_bytes: u64,
    /// Poll interval, in seconds, for the resident-memory sampler.
    pub poll_interval_secs: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 0,
            poll_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn vad_threshold_out_of_range_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.vad_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn min_speech_ms_below_floor_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.min_speech_ms = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tts_speed_out_of_range_rejected() {
        let mut cfg = TtsConfig::default();
        cfg.speed = 3.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tts_pitch_out_of_range_rejected() {
        let mut cfg = TtsConfig::default();
        cfg.pitch_semitones = 20.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_toml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline]\nvad_threshold = 0.8\n").expect("write");
        let cfg = RuntimeConfig::load(&path).expect("load");
        assert!((cfg.pipeline.vad_threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(cfg.pipeline.min_speech_ms, 250);
    }
}
