//! Kokoro-82M TTS engine — single-model ONNX inference with misaki
//! phonemization.

mod engine;
mod phonemize;

pub use engine::{KokoroPaths, KokoroTts, SAMPLE_RATE};
