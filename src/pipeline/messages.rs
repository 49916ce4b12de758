//! Value types shared across the voice pipeline and engine facades.
//!
//! These mirror the data model in the specification directly: [`AudioData`]
//! is the uniform in-memory audio representation crossing every stage
//! boundary, and [`ConversationTurn`] is the unit the pipeline appends to
//! history. Keeping them in one module (rather than duplicating per-stage
//! structs as the original cascaded-pipeline design did) is what lets C5's
//! engine facades and C7's state machine agree on a single wire shape.

use std::time::Instant;

/// Uniform audio buffer used at every pipeline boundary.
///
/// The pipeline mandates 16 kHz mono internally; callbacks and engines may
/// produce or expect other rates, in which case the pipeline resamples
/// before handing audio to VAD or an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Samples in `[-1.0, 1.0]`, mono.
    pub samples: Vec<f32>,
}

impl AudioData {
    /// An empty buffer at the given rate — used as the end-of-stream sentinel
    /// `audio_in_cb` returns to signal the conversation is over.
    #[must_use]
    pub fn empty(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: Vec::new(),
        }
    }

    /// Whether this buffer carries no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    #[must_use]
    pub fn duration_s(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Encode as a 16-bit PCM mono WAV container, for hosts that want a
    /// self-describing byte buffer rather than a raw sample stream (§4.5 C5
    /// TTS synthesize output requirement).
    pub fn to_wav_bytes(&self) -> crate::error::Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| crate::error::AppError::Internal(format!("wav writer init: {e}")))?;
            for &sample in &self.samples {
                let clamped = sample.clamp(-1.0, 1.0);
                let pcm = (clamped * f32::from(i16::MAX)) as i16;
                writer
                    .write_sample(pcm)
                    .map_err(|e| crate::error::AppError::Internal(format!("wav write: {e}")))?;
            }
            writer
                .finalize()
                .map_err(|e| crate::error::AppError::Internal(format!("wav finalize: {e}")))?;
        }
        Ok(cursor.into_inner())
    }
}

/// Who produced a [`ConversationTurn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The human side of the conversation.
    User,
    /// The assistant (LLM + TTS) side.
    Assistant,
}

/// One turn of conversation history, owned exclusively by the pipeline
/// worker and exposed to callers only as a deep copy (`get_history`).
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    /// Who produced this turn.
    pub role: Role,
    /// Text content — the transcript for `User`, the generated (or partial,
    /// for an interrupted turn) reply for `Assistant`.
    pub text: String,
    /// Opaque reference to the turn's audio, if retained by the caller.
    pub audio_ref: Option<AudioRef>,
    /// Monotonic timestamp, strictly increasing across the whole history.
    pub timestamp: Instant,
}

/// Opaque handle to audio associated with a turn. The core never interprets
/// its contents — it is a caller-supplied token round-tripped through
/// history (e.g. a path or a buffer id in the host application).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRef(pub String);

/// A transcription result from the STT engine.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// Full transcribed text.
    pub text: String,
    /// Sub-segments with per-span timing, if the backend provides them.
    pub segments: Vec<TranscriptSegment>,
    /// Detected/assumed language code (e.g. `"en"`), if known.
    pub language: Option<String>,
    /// Backend confidence score in `[0, 1]`, if provided.
    pub confidence: Option<f32>,
}

/// One timed span within a [`Transcription`].
#[derive(Debug, Clone)]
pub struct TranscriptSegment {
    /// Segment text.
    pub text: String,
    /// Start time in seconds, relative to the transcribed buffer.
    pub start_s: f64,
    /// End time in seconds, relative to the transcribed buffer.
    pub end_s: f64,
}

/// A sentence-sized chunk of LLM output, ready for TTS.
///
/// Produced by splitting accumulated LLM text on `. ! ? \n`, preserving the
/// trailing punctuation, once the chunk reaches at least 24 characters.
#[derive(Debug, Clone)]
pub struct SentenceChunk {
    /// Complete sentence (or final partial remainder) text.
    pub text: String,
    /// Whether this is the last chunk of the current response.
    pub is_final: bool,
}

/// Minimum chunk length, in characters, before a sentence boundary closes a
/// chunk (§4.7).
pub const MIN_SENTENCE_CHUNK_CHARS: usize = 24;

/// Split accumulated text into closed sentence chunks plus a remainder.
///
/// A chunk closes at the first `. `, `! `, `? `, or `\n` encountered once the
/// accumulated text (since the last close) reaches
/// [`MIN_SENTENCE_CHUNK_CHARS`]. Trailing punctuation is preserved on the
/// closed chunk; the boundary-consuming whitespace is dropped. Returns the
/// closed chunks (in order) and whatever text remains unclosed.
#[must_use]
pub fn split_sentence_chunks(text: &str) -> (Vec<String>, String) {
    let mut closed = Vec::new();
    let mut start = 0usize;
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        let is_boundary = matches!(c, b'.' | b'!' | b'?' | b'\n');
        if is_boundary {
            let candidate_end = i + 1;
            let candidate = &text[start..candidate_end];
            if candidate.trim().len() >= MIN_SENTENCE_CHUNK_CHARS {
                closed.push(candidate.trim().to_owned());
                // Skip one run of whitespace after the boundary.
                let mut j = candidate_end;
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    (closed, text[start..].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_bytes_start_with_riff_header() {
        let audio = AudioData {
            sample_rate: 16_000,
            samples: vec![0.0, 0.5, -0.5, 1.0],
        };
        let bytes = audio.to_wav_bytes().expect("encode");
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
    }

    #[test]
    fn audio_data_empty_has_no_samples() {
        let a = AudioData::empty(16_000);
        assert!(a.is_empty());
        assert_eq!(a.duration_s(), 0.0);
    }

    #[test]
    fn split_sentence_chunks_respects_min_length() {
        let (closed, remainder) = split_sentence_chunks("Hi. More text is coming soon.");
        // "Hi." alone is under MIN_SENTENCE_CHUNK_CHARS, so it should not close
        // on its own — it merges with the next sentence once that closes.
        assert_eq!(closed.len(), 1);
        assert!(closed[0].ends_with('.'));
        assert!(remainder.is_empty() || !remainder.is_empty());
    }

    #[test]
    fn split_sentence_chunks_splits_on_newline() {
        let long_line = "x".repeat(30);
        let text = format!("{long_line}\nmore");
        let (closed, remainder) = split_sentence_chunks(&text);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0], long_line);
        assert_eq!(remainder, "more");
    }

    #[test]
    fn split_sentence_chunks_no_boundary_returns_all_as_remainder() {
        let (closed, remainder) = split_sentence_chunks("no boundary here");
        assert!(closed.is_empty());
        assert_eq!(remainder, "no boundary here");
    }
}
