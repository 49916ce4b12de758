//! Text-to-speech engine facade (C5 TTS variant).
//!
//! Wraps concrete backends behind the uniform `load/unload/is_loaded`
//! contract plus `synthesize`/`voices` (§4.5). The only backend shipped is
//! Kokoro-82M (ONNX), gated behind the `tts-kokoro` feature the same way the
//! original pipeline dispatched between Kokoro and an alternate cloning
//! backend.

pub mod kokoro;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::clock::TTS_CHUNK_TIMEOUT;
use crate::error::{AppError, InvalidInputError, IoError, NotFoundError, Result};
use crate::handle::{ModelHandle, HANDLES};
use crate::lifecycle::{EngineRegistry, LoadedModel};
use crate::pipeline::messages::AudioData;

/// A synthesizable voice identity exposed by a loaded TTS model.
#[derive(Debug, Clone)]
pub struct VoiceInfo {
    /// Stable voice identifier, e.g. `"af_heart"`.
    pub id: String,
}

/// Per-call synthesis parameters.
#[derive(Debug, Clone)]
pub struct TtsGenConfig {
    /// Voice to use; `None` selects the bundle's default.
    pub voice: Option<String>,
    /// Playback speed multiplier, must lie in `[0.5, 2.0]`.
    pub speed: f32,
    /// Pitch shift in semitones, must lie in `[-12.0, 12.0]`.
    pub pitch_semitones: f32,
}

impl Default for TtsGenConfig {
    fn default() -> Self {
        Self {
            voice: None,
            speed: 1.0,
            pitch_semitones: 0.0,
        }
    }
}

impl TtsGenConfig {
    fn validate(&self) -> Result<()> {
        if !(0.5..=2.0).contains(&self.speed) {
            return Err(InvalidInputError::ParameterValue(format!(
                "tts speed {} out of range [0.5, 2.0]",
                self.speed
            ))
            .into());
        }
        if !(-12.0..=12.0).contains(&self.pitch_semitones) {
            return Err(InvalidInputError::ParameterValue(format!(
                "tts pitch {} semitones out of range [-12, 12]",
                self.pitch_semitones
            ))
            .into());
        }
        Ok(())
    }
}

enum Backend {
    #[cfg(feature = "tts-kokoro")]
    Kokoro(kokoro::KokoroTts),
}

impl Backend {
    async fn synthesize(&mut self, text: &str, speed: f32, voice: Option<&str>) -> Result<Vec<f32>> {
        match self {
            #[cfg(feature = "tts-kokoro")]
            Self::Kokoro(k) => k.synthesize(text, speed, voice).await,
        }
    }

    fn sample_rate(&self) -> u32 {
        match self {
            #[cfg(feature = "tts-kokoro")]
            Self::Kokoro(_) => kokoro::SAMPLE_RATE,
        }
    }
}

struct Loaded {
    /// Wrapped in its own async mutex so a synthesis call can hold it across
    /// the inference `.await` without the registry map (a plain
    /// [`std::sync::Mutex`]) ever being locked across an await point.
    backend: Arc<tokio::sync::Mutex<Backend>>,
    model_id: String,
    size_bytes: u64,
    voices: Vec<String>,
    sample_rate: u32,
    last_used: Instant,
}

/// TTS engine facade. Cheap to clone; internal state is `Arc`-shared.
///
/// The loaded-model map is a plain [`std::sync::Mutex`]: every method here
/// locks it only for synchronous bookkeeping and always drops the guard
/// before awaiting anything, so [`EngineRegistry`]'s sync methods can lock
/// it directly instead of bridging into the async runtime.
#[derive(Clone)]
pub struct TtsFacade {
    loaded: Arc<Mutex<HashMap<ModelHandle, Loaded>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Default for TtsFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl TtsFacade {
    /// Construct an empty facade with no models loaded.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaded: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load a voice bundle directory (`model.onnx`, `tokenizer.json`,
    /// `voices/*.bin`) and return a handle to it.
    pub async fn load(&self, path: &Path) -> Result<ModelHandle> {
        if !path.exists() {
            return Err(crate::error::NotFoundError::File(path.to_path_buf()).into());
        }
        let model_id = model_id_from_path(path);

        #[cfg(feature = "tts-kokoro")]
        {
            let paths = kokoro::KokoroPaths::discover(path, None)?;
            let voices = kokoro::KokoroPaths::available_voices(path);
            let engine = kokoro::KokoroTts::from_paths(&paths, false)?;
            let size_bytes = std::fs::metadata(&paths.model_onnx).map(|m| m.len()).unwrap_or(0);
            let backend = Backend::Kokoro(engine);
            let sample_rate = backend.sample_rate();

            let handle = HANDLES.issue();
            lock(&self.loaded).insert(
                handle,
                Loaded {
                    backend: Arc::new(tokio::sync::Mutex::new(backend)),
                    model_id,
                    size_bytes,
                    voices,
                    sample_rate,
                    last_used: Instant::now(),
                },
            );
            return Ok(handle);
        }

        #[cfg(not(feature = "tts-kokoro"))]
        {
            let _ = model_id;
            Err(AppError::Integrity(crate::error::IntegrityError::UnsupportedFormat(
                "no TTS backend compiled in".to_owned(),
            )))
        }
    }

    /// Unload a model. Idempotent after the first success.
    pub async fn unload(&self, handle: ModelHandle) -> Result<()> {
        lock(&self.loaded).remove(&handle);
        Ok(())
    }

    /// Whether `handle` currently refers to a loaded model.
    pub async fn is_loaded(&self, handle: ModelHandle) -> bool {
        lock(&self.loaded).contains_key(&handle)
    }

    /// Voices available on the loaded bundle.
    pub async fn voices(&self, handle: ModelHandle) -> Result<Vec<VoiceInfo>> {
        let guard = lock(&self.loaded);
        let loaded = guard
            .get(&handle)
            .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
        Ok(loaded.voices.iter().cloned().map(|id| VoiceInfo { id }).collect())
    }

    /// Synthesize `text` with `handle`'s model. Cancellable; bounded by
    /// [`TTS_CHUNK_TIMEOUT`], which fires `cancel` if the backend hasn't
    /// returned in time. On cancellation or timeout no partial audio is
    /// returned.
    pub async fn synthesize(
        &self,
        handle: ModelHandle,
        text: &str,
        cfg: &TtsGenConfig,
        cancel: &CancellationToken,
    ) -> Result<AudioData> {
        cfg.validate()?;
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let (backend, sample_rate, voices) = {
            let mut guard = lock(&self.loaded);
            let loaded = guard
                .get_mut(&handle)
                .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
            loaded.last_used = Instant::now();
            (Arc::clone(&loaded.backend), loaded.sample_rate, loaded.voices.clone())
        };

        if let Some(voice) = cfg.voice.as_deref() {
            if !voices.iter().any(|v| v == voice) {
                return Err(InvalidInputError::ParameterValue(format!(
                    "unknown tts voice {voice:?}"
                ))
                .into());
            }
        }

        let speed = cfg.speed;
        let voice = cfg.voice.clone();
        let text = text.to_owned();
        let synth = async move { backend.lock().await.synthesize(&text, speed, voice.as_deref()).await };

        let raw = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            outcome = tokio::time::timeout(TTS_CHUNK_TIMEOUT, synth) => match outcome {
                Ok(result) => result?,
                Err(_elapsed) => {
                    cancel.cancel();
                    return Err(AppError::Io(IoError::Timeout(TTS_CHUNK_TIMEOUT)));
                }
            },
        };

        let samples = if (cfg.pitch_semitones).abs() > f32::EPSILON {
            shift_pitch(&raw, cfg.pitch_semitones)
        } else {
            raw
        };

        Ok(AudioData { sample_rate, samples })
    }
}

impl EngineRegistry for TtsFacade {
    fn unload_model(&self, model_id: &str) -> Result<()> {
        lock(&self.loaded).retain(|_, v| v.model_id != model_id);
        Ok(())
    }

    fn is_model_loaded(&self, model_id: &str) -> bool {
        lock(&self.loaded).values().any(|v| v.model_id == model_id)
    }

    fn loaded_models(&self) -> Vec<LoadedModel> {
        lock(&self.loaded)
            .values()
            .map(|v| LoadedModel {
                model_id: v.model_id.clone(),
                size_bytes: v.size_bytes,
                last_used: v.last_used,
            })
            .collect()
    }
}

/// A model's catalog id from its storage path, following the registry's
/// `<root>/<model_id>/<version>/...` layout.
fn model_id_from_path(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Naive pitch shift by linear-interpolation resampling. Changes duration
/// along with pitch, matching how Kokoro (no native pitch control) is
/// adjusted by callers today.
fn shift_pitch(samples: &[f32], semitones: f32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let ratio = 2f32.powf(semitones / 12.0);
    let out_len = ((samples.len() as f32) / ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f32 * ratio;
        let idx = src_pos.floor() as usize;
        if idx + 1 < samples.len() {
            let frac = src_pos - idx as f32;
            out.push(samples[idx] * (1.0 - frac) + samples[idx + 1] * frac);
        } else {
            out.push(*samples.last().unwrap_or(&0.0));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_out_of_range_speed() {
        let cfg = TtsGenConfig {
            speed: 3.0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidInput(InvalidInputError::ParameterValue(_))
        ));
    }

    #[test]
    fn config_rejects_out_of_range_pitch() {
        let cfg = TtsGenConfig {
            pitch_semitones: 20.0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidInput(InvalidInputError::ParameterValue(_))
        ));
    }

    #[test]
    fn config_default_is_valid() {
        assert!(TtsGenConfig::default().validate().is_ok());
    }

    #[test]
    fn shift_pitch_up_shortens_buffer() {
        let samples = vec![0.0f32; 1000];
        let shifted = shift_pitch(&samples, 12.0);
        assert!(shifted.len() < samples.len());
    }

    #[test]
    fn shift_pitch_identity_is_noop_length() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let shifted = shift_pitch(&samples, 0.0);
        assert_eq!(shifted.len(), samples.len());
    }

    #[tokio::test]
    async fn load_missing_path_fails_not_found() {
        let facade = TtsFacade::new();
        let err = facade
            .load(Path::new("/nonexistent/tts/bundle"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(NotFoundError::File(_))));
    }

    #[tokio::test]
    async fn unknown_handle_is_not_loaded() {
        let facade = TtsFacade::new();
        assert!(!facade.is_loaded(ModelHandle::from_raw(999)).await);
    }
}
