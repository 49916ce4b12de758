//! Kokoro-82M ONNX inference engine.
//!
//! Single-model TTS: phonemize → tokenize → ONNX inference → 24 kHz audio.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use super::phonemize::Phonemizer;
use crate::error::{AppError, Result};

/// Maximum context length for Kokoro (including pad tokens).
const MAX_CONTEXT: usize = 512;

/// Output sample rate in Hz.
pub const SAMPLE_RATE: u32 = 24_000;

/// Paths making up one Kokoro voice bundle on disk, laid out as:
/// `<dir>/model.onnx`, `<dir>/tokenizer.json`, `<dir>/voices/<name>.bin`.
pub struct KokoroPaths {
    /// Path to the ONNX model file.
    pub model_onnx: PathBuf,
    /// Path to `tokenizer.json`.
    pub tokenizer_json: PathBuf,
    /// Directory containing one `<name>.bin` style file per voice.
    pub voices_dir: PathBuf,
    /// Name of the voice used when a call doesn't request one explicitly.
    pub default_voice: String,
}

impl KokoroPaths {
    /// Resolve the standard bundle layout under `dir`, selecting `voice` (or
    /// the first `.bin` file found under `voices/` if `voice` is `None`) as
    /// the default voice a call may omit.
    pub fn discover(dir: &Path, voice: Option<&str>) -> Result<Self> {
        let model_onnx = dir.join("model.onnx");
        let tokenizer_json = dir.join("tokenizer.json");
        let voices_dir = dir.join("voices");

        let default_voice = if let Some(name) = voice {
            if !voices_dir.join(format!("{name}.bin")).exists() {
                return Err(AppError::Internal(format!(
                    "voice {name:?} not found under {}",
                    voices_dir.display()
                )));
            }
            name.to_owned()
        } else {
            std::fs::read_dir(&voices_dir)
                .map_err(|e| AppError::Internal(format!("no voices directory in {}: {e}", dir.display())))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("bin"))
                .find_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .ok_or_else(|| AppError::Internal(format!("no voice files under {}", voices_dir.display())))?
        };

        Ok(Self {
            model_onnx,
            tokenizer_json,
            voices_dir,
            default_voice,
        })
    }

    /// Every voice name available in this bundle's `voices/` directory.
    pub fn available_voices(dir: &Path) -> Vec<String> {
        let voices_dir = dir.join("voices");
        std::fs::read_dir(&voices_dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect()
    }
}

/// Kokoro TTS engine.
///
/// Wraps a single ONNX session, the tokenizer, phonemizer, and a voice
/// style embedding. Synthesizes text to 24 kHz f32 mono audio.
pub struct KokoroTts {
    session: Session,
    tokenizer: tokenizers::Tokenizer,
    phonemizer: Phonemizer,
    /// Raw voice style tensors, one per voice name, each shape `(N, 1, 256)`
    /// stored flat. Index a chosen voice's vector by `[token_count]` to get
    /// the context-appropriate 256-dim slice.
    voices: HashMap<String, Vec<f32>>,
    default_voice: String,
}

impl KokoroTts {
    /// Load the Kokoro engine from a resolved voice bundle, preloading every
    /// voice style under `voices_dir` so a call can select any of them
    /// without reloading the bundle (§4.5 TTS per-call `voice` parameter).
    pub fn from_paths(paths: &KokoroPaths, british: bool) -> Result<Self> {
        info!("loading Kokoro ONNX model");
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(4))
            .and_then(|b| b.commit_from_file(&paths.model_onnx))
            .map_err(|e| AppError::Internal(format!("failed to load Kokoro ONNX model: {e}")))?;

        info!("loading tokenizer");
        let tokenizer = load_tokenizer(&paths.tokenizer_json)?;

        info!("initialising misaki phonemizer (british={british})");
        let phonemizer = Phonemizer::new(british);

        info!("loading voice styles from {}", paths.voices_dir.display());
        let voices = load_all_voices(&paths.voices_dir)?;
        if !voices.contains_key(&paths.default_voice) {
            return Err(AppError::Internal(format!(
                "default voice {:?} missing from {}",
                paths.default_voice,
                paths.voices_dir.display()
            )));
        }

        Ok(Self {
            session,
            tokenizer,
            phonemizer,
            voices,
            default_voice: paths.default_voice.clone(),
        })
    }

    /// Synthesize text to audio samples at the given `speed` (clamped to
    /// `[0.5, 2.0]` by the facade before this is called) using `voice`, or
    /// this bundle's default voice if `voice` is `None`.
    ///
    /// Returns f32 audio samples at 24 kHz mono. Uses `block_in_place` since
    /// ONNX inference is synchronous.
    pub async fn synthesize(&mut self, text: &str, speed: f32, voice: Option<&str>) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let voice_name = voice.unwrap_or(&self.default_voice);
        let voice_styles = self.voices.get(voice_name).ok_or_else(|| {
            AppError::Internal(format!("unknown tts voice {voice_name:?}"))
        })?;

        info!("synthesizing: \"{text}\" (voice={voice_name}, speed={speed})");
        let start = std::time::Instant::now();

        let ipa = self.phonemizer.phonemize(text)?;
        if ipa.is_empty() {
            return Ok(Vec::new());
        }
        info!("phonemized: \"{ipa}\" ({} chars)", ipa.len());

        // We stripped the post-processor (tokenizers v0.22 compat) so we
        // manually wrap with pad token (id=0) at start and end.
        let encoding = self
            .tokenizer
            .encode(ipa.as_str(), false)
            .map_err(|e| AppError::Internal(format!("tokenization failed: {e}")))?;

        let raw_ids = encoding.get_ids();
        let mut token_ids: Vec<i64> = Vec::with_capacity(raw_ids.len() + 2);
        token_ids.push(0);
        token_ids.extend(raw_ids.iter().map(|&id| id as i64));
        token_ids.push(0);

        if token_ids.len() > MAX_CONTEXT {
            return Err(AppError::Internal(format!(
                "input too long: {} tokens (max {})",
                token_ids.len(),
                MAX_CONTEXT,
            )));
        }

        // Select voice style vector based on content token count.
        // voice_styles is shape (N, 1, 256); indexed by token count (without pads).
        let content_len = token_ids.len().saturating_sub(2).max(1);
        let num_entries = voice_styles.len() / 256;
        let style_index = content_len.min(num_entries.saturating_sub(1));
        let style_offset = style_index * 256;
        let style_vec: Vec<f32> = voice_styles[style_offset..style_offset + 256].to_vec();

        let speed = speed.clamp(0.5, 2.0);
        let samples =
            tokio::task::block_in_place(|| self.run_inference(&token_ids, &style_vec, speed))?;

        let elapsed = start.elapsed();
        info!(
            "synthesized {} samples ({:.1}s audio) in {:.0}ms",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32,
            elapsed.as_millis(),
        );

        Ok(samples)
    }

    fn run_inference(&mut self, token_ids: &[i64], style: &[f32], speed: f32) -> Result<Vec<f32>> {
        use ort::session::{SessionInputValue, SessionInputs};

        let seq_len = token_ids.len();

        let input_ids = Tensor::from_array(([1_usize, seq_len], token_ids.to_vec()))
            .map_err(|e| AppError::Internal(format!("failed to create input_ids tensor: {e}")))?;
        let style_tensor = Tensor::from_array(([1_usize, 256], style.to_vec()))
            .map_err(|e| AppError::Internal(format!("failed to create style tensor: {e}")))?;
        let speed_tensor = Tensor::from_array(([1_usize], vec![speed]))
            .map_err(|e| AppError::Internal(format!("failed to create speed tensor: {e}")))?;

        let mut feed: HashMap<String, SessionInputValue> = HashMap::new();
        feed.insert("input_ids".to_string(), input_ids.into());
        feed.insert("style".to_string(), style_tensor.into());
        feed.insert("speed".to_string(), speed_tensor.into());

        let outputs = self
            .session
            .run(SessionInputs::from(feed))
            .map_err(|e| AppError::Internal(format!("ONNX inference failed: {e}")))?;

        let output_value = &outputs[0_usize];
        let (_shape, data) = output_value
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Internal(format!("failed to extract output tensor: {e}")))?;

        Ok(data.to_vec())
    }
}

/// Load and patch the Kokoro tokenizer.
///
/// The `tokenizers` crate v0.22 cannot deserialize the `TemplateProcessing`
/// post-processor in Kokoro's `tokenizer.json`. We strip it and handle pad
/// token insertion manually in `synthesize()`.
fn load_tokenizer(path: &Path) -> Result<tokenizers::Tokenizer> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Internal(format!(
            "failed to read tokenizer file {}: {e}",
            path.display()
        ))
    })?;

    let mut json: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| AppError::Internal(format!("failed to parse tokenizer JSON: {e}")))?;

    if let Some(obj) = json.as_object_mut() {
        obj.remove("post_processor");
        if let Some(model) = obj.get_mut("model").and_then(|m| m.as_object_mut()) {
            if !model.contains_key("type") {
                model.insert(
                    "type".to_string(),
                    serde_json::Value::String("WordLevel".to_string()),
                );
            }
            if !model.contains_key("unk_token") {
                model.insert(
                    "unk_token".to_string(),
                    serde_json::Value::String("$".to_string()),
                );
            }
        }
    }

    let patched = serde_json::to_string(&json)
        .map_err(|e| AppError::Internal(format!("failed to serialize patched tokenizer: {e}")))?;

    tokenizers::Tokenizer::from_bytes(patched)
        .map_err(|e| AppError::Internal(format!("failed to load tokenizer: {e}")))
}

/// Load every `<name>.bin` voice style file under `voices_dir`, keyed by
/// file stem, so a per-call `voice` selection never needs to touch disk.
fn load_all_voices(voices_dir: &Path) -> Result<HashMap<String, Vec<f32>>> {
    let mut voices = HashMap::new();
    let entries = std::fs::read_dir(voices_dir).map_err(|e| {
        AppError::Internal(format!("no voices directory at {}: {e}", voices_dir.display()))
    })?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("bin") {
            continue;
        }
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        voices.insert(name, load_voice_styles(&path)?);
    }
    if voices.is_empty() {
        return Err(AppError::Internal(format!(
            "no voice files under {}",
            voices_dir.display()
        )));
    }
    Ok(voices)
}

/// Load a voice style `.bin` file as a flat f32 vector.
///
/// The file contains raw f32 values with shape `(N, 1, 256)` where N is
/// typically 511. We store it flat and index by `[i * 256 .. (i+1) * 256]`.
fn load_voice_styles(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)
        .map_err(|e| AppError::Internal(format!("failed to read voice file {}: {e}", path.display())))?;

    if bytes.len() % 4 != 0 {
        return Err(AppError::Internal(format!(
            "voice file size {} is not a multiple of 4 (expected f32 array)",
            bytes.len()
        )));
    }

    let float_count = bytes.len() / 4;
    if float_count % 256 != 0 {
        return Err(AppError::Internal(format!(
            "voice file has {float_count} floats, not a multiple of 256"
        )));
    }

    let mut floats = vec![0.0f32; float_count];
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        floats[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    Ok(floats)
}
