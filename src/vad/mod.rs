//! Voice Activity Detection — frame-based energy segmenter (C6).
//!
//! Audio is split into 20 ms frames at 16 kHz. A frame is "voiced" when its
//! RMS level in dB exceeds a noise floor (estimated from the quietest frames
//! in the buffer) by a threshold-dependent gain, linearly interpolated
//! between 6 dB (permissive) and 24 dB (strict) as the normalized
//! `[0.0, 1.0]` threshold goes from 0 to 1. Voiced frames separated by short
//! gaps are joined into a single segment; segments shorter than
//! `min_speech_ms` are discarded as noise bursts.
//!
//! [`detect_voice_activity`] is the batch entry point used directly by the
//! STT engine facade (`detect_voice_activity(audio, threshold)`); the crate's
//! conversation pipeline drives the same frame math incrementally through
//! [`StreamingSegmenter`] so a segment can close as soon as enough trailing
//! silence has been observed, without waiting for the whole utterance.

use crate::error::{AppError, InvalidInputError, Result};
use crate::pipeline::messages::AudioData;

/// Frame size used for energy analysis, fixed by the data model at 16 kHz.
pub const SAMPLE_RATE_HZ: u32 = 16_000;
/// Frame duration in milliseconds.
pub const FRAME_MS: u32 = 20;
/// Frame length in samples at [`SAMPLE_RATE_HZ`].
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE_HZ as usize * FRAME_MS as usize) / 1000;

const GAIN_MIN_DB: f64 = 6.0;
const GAIN_MAX_DB: f64 = 24.0;
/// Floor used in place of `-inf` for a silent (all-zero) frame.
const SILENT_FRAME_DB: f64 = -120.0;

/// A detected speech interval, in seconds relative to the start of the audio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioSegment {
    /// Start time in seconds. Always `< end`.
    pub start_s: f64,
    /// End time in seconds.
    pub end_s: f64,
}

/// Linear interpolation of the voicing gain, in dB, for a normalized threshold.
#[must_use]
pub fn gain_db(threshold: f32) -> f64 {
    let t = f64::from(threshold.clamp(0.0, 1.0));
    GAIN_MIN_DB + t * (GAIN_MAX_DB - GAIN_MIN_DB)
}

/// RMS level of a frame, in dB relative to full scale (0 dB = amplitude 1.0).
#[must_use]
pub fn frame_rms_db(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return SILENT_FRAME_DB;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt();
    if rms <= 1e-9 {
        SILENT_FRAME_DB
    } else {
        20.0 * rms.log10()
    }
}

/// Validate a normalized VAD threshold, matching the Engine Facade contract.
pub fn validate_threshold(threshold: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(InvalidInputError::ParameterValue(format!(
            "vad threshold must be in [0.0, 1.0], got {threshold}"
        ))
        .into());
    }
    Ok(())
}

/// Estimate the noise floor of a frame sequence as the 20th percentile of
/// per-frame dB levels — robust to a handful of loud frames without needing
/// to know in advance which frames are speech.
fn estimate_noise_floor(frame_db: &[f64]) -> f64 {
    if frame_db.is_empty() {
        return SILENT_FRAME_DB;
    }
    let mut sorted = frame_db.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = (sorted.len() as f64 * 0.2) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Split `audio.samples` into fixed-size 20 ms frames at the audio's own
/// sample rate, scaled so frame boundaries land at 16 kHz-equivalent time.
fn frame_energies(audio: &AudioData) -> Vec<f64> {
    let frame_len = ((f64::from(audio.sample_rate) * f64::from(FRAME_MS)) / 1000.0).round() as usize;
    let frame_len = frame_len.max(1);
    audio
        .samples
        .chunks(frame_len)
        .map(frame_rms_db)
        .collect()
}

/// Detect speech intervals in a complete buffer of audio (§4.6).
///
/// Returns segments with `start < end` in seconds, sorted by start time and
/// non-overlapping. Fails with `InvalidParameterValue` if `threshold` is
/// outside `[0, 1]`, and `EmptyInput` if `audio.samples` is empty.
pub fn detect_voice_activity(
    audio: &AudioData,
    threshold: f32,
    min_speech_ms: u32,
    silence_timeout_ms: u32,
) -> Result<Vec<AudioSegment>> {
    validate_threshold(threshold)?;
    if audio.samples.is_empty() {
        return Err(InvalidInputError::EmptyInput.into());
    }

    let frame_len = ((f64::from(audio.sample_rate) * f64::from(FRAME_MS)) / 1000.0).round() as usize;
    let frame_len = frame_len.max(1);
    let frame_secs = frame_len as f64 / f64::from(audio.sample_rate);

    let frame_db = frame_energies(audio);
    let noise_floor = estimate_noise_floor(&frame_db);
    let gain = gain_db(threshold);

    let voiced: Vec<bool> = frame_db.iter().map(|&db| db > noise_floor + gain).collect();

    let silence_tolerance_frames =
        (f64::from(silence_timeout_ms) / f64::from(FRAME_MS)).ceil() as usize;
    let min_speech_frames = (f64::from(min_speech_ms) / f64::from(FRAME_MS)).ceil() as usize;

    let mut segments = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut trailing_silence = 0usize;
    let mut run_last_voiced = 0usize;

    for (i, &is_voiced) in voiced.iter().enumerate() {
        if is_voiced {
            if run_start.is_none() {
                run_start = Some(i);
            }
            run_last_voiced = i;
            trailing_silence = 0;
        } else if let Some(start) = run_start {
            trailing_silence += 1;
            if trailing_silence > silence_tolerance_frames {
                close_run(
                    &mut segments,
                    start,
                    run_last_voiced,
                    min_speech_frames,
                    frame_secs,
                );
                run_start = None;
                trailing_silence = 0;
            }
        }
    }
    if let Some(start) = run_start {
        close_run(
            &mut segments,
            start,
            run_last_voiced,
            min_speech_frames,
            frame_secs,
        );
    }

    Ok(segments)
}

fn close_run(
    segments: &mut Vec<AudioSegment>,
    start_frame: usize,
    last_voiced_frame: usize,
    min_speech_frames: usize,
    frame_secs: f64,
) {
    let len_frames = last_voiced_frame - start_frame + 1;
    if len_frames < min_speech_frames.max(1) {
        return;
    }
    segments.push(AudioSegment {
        start_s: start_frame as f64 * frame_secs,
        end_s: (last_voiced_frame + 1) as f64 * frame_secs,
    });
}

/// An event produced by [`StreamingSegmenter`] as audio chunks arrive live.
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// No segment boundary crossed on this chunk.
    Idle,
    /// A new speech segment started (useful for fast barge-in detection).
    SpeechStarted,
    /// A speech segment closed; `samples` is the concatenated utterance at
    /// the segmenter's configured sample rate.
    SegmentClosed {
        /// Concatenated audio for the whole utterance.
        samples: Vec<f32>,
    },
}

/// Incremental counterpart of [`detect_voice_activity`] for live audio.
///
/// Feeds frames as they arrive and closes a segment as soon as
/// `silence_timeout_ms` of trailing silence has been observed, rather than
/// requiring the whole buffer up front. The noise floor is tracked as a
/// slow-moving estimate over unvoiced frames so long conversations adapt to
/// a changing noise environment.
pub struct StreamingSegmenter {
    sample_rate: u32,
    threshold: f32,
    min_speech_frames: usize,
    silence_tolerance_frames: usize,
    noise_floor_db: f64,
    in_speech: bool,
    buffer: Vec<f32>,
    voiced_frame_count: usize,
    silent_run: usize,
    frame_carry: Vec<f32>,
}

impl StreamingSegmenter {
    /// Create a segmenter for a given sample rate and the pipeline's
    /// configured threshold/timing parameters.
    #[must_use]
    pub fn new(sample_rate: u32, threshold: f32, min_speech_ms: u32, silence_timeout_ms: u32) -> Self {
        let frame_len = ((f64::from(sample_rate) * f64::from(FRAME_MS)) / 1000.0).round() as usize;
        let frame_len = frame_len.max(1);
        Self {
            sample_rate,
            threshold,
            min_speech_frames: (f64::from(min_speech_ms) / f64::from(FRAME_MS)).ceil() as usize,
            silence_tolerance_frames: (f64::from(silence_timeout_ms) / f64::from(FRAME_MS)).ceil()
                as usize,
            noise_floor_db: SILENT_FRAME_DB,
            in_speech: false,
            buffer: Vec::new(),
            voiced_frame_count: 0,
            silent_run: 0,
            frame_carry: Vec::with_capacity(frame_len),
        }
    }

    fn frame_len(&self) -> usize {
        ((f64::from(self.sample_rate) * f64::from(FRAME_MS)) / 1000.0).round() as usize
    }

    /// Feed raw samples (any length) and drain any completed frames.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<VadEvent> {
        let frame_len = self.frame_len().max(1);
        let mut events = Vec::new();
        self.frame_carry.extend_from_slice(samples);
        while self.frame_carry.len() >= frame_len {
            let frame: Vec<f32> = self.frame_carry.drain(..frame_len).collect();
            if let Some(event) = self.push_frame(&frame) {
                events.push(event);
            }
        }
        events
    }

    fn push_frame(&mut self, frame: &[f32]) -> Option<VadEvent> {
        let db = frame_rms_db(frame);
        let gain = gain_db(self.threshold);
        let is_voiced = db > self.noise_floor_db + gain;

        if !is_voiced {
            // Slow exponential adaptation of the floor towards quiet frames only.
            self.noise_floor_db = if self.noise_floor_db <= SILENT_FRAME_DB {
                db
            } else {
                0.95 * self.noise_floor_db + 0.05 * db
            };
        }

        if is_voiced {
            if !self.in_speech {
                self.in_speech = true;
                self.buffer.clear();
                self.voiced_frame_count = 0;
                self.buffer.extend_from_slice(frame);
                self.silent_run = 0;
                return Some(VadEvent::SpeechStarted);
            }
            self.voiced_frame_count += 1;
            self.buffer.extend_from_slice(frame);
            self.silent_run = 0;
            None
        } else if self.in_speech {
            self.buffer.extend_from_slice(frame);
            self.silent_run += 1;
            if self.silent_run > self.silence_tolerance_frames {
                self.in_speech = false;
                self.silent_run = 0;
                if self.voiced_frame_count >= self.min_speech_frames.max(1) {
                    let samples = std::mem::take(&mut self.buffer);
                    return Some(VadEvent::SegmentClosed { samples });
                }
                self.buffer.clear();
            }
            None
        } else {
            None
        }
    }

    /// Whether a speech segment is currently open (used for barge-in checks).
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Reset all internal state, e.g. when re-entering `Listening`.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.buffer.clear();
        self.voiced_frame_count = 0;
        self.silent_run = 0;
        self.frame_carry.clear();
        self.noise_floor_db = SILENT_FRAME_DB;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq_hz: f32, amplitude: f32, duration_s: f32, sample_rate: u32) -> Vec<f32> {
        let n = (duration_s * sample_rate as f32) as usize;
        (0..n)
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * freq_hz * (i as f32) / sample_rate as f32).sin()
            })
            .collect()
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let audio = AudioData {
            sample_rate: 16_000,
            samples: vec![0.0; 16_000],
        };
        let err = detect_voice_activity(&audio, 1.5, 250, 800).unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidInput(InvalidInputError::ParameterValue(_))
        ));
    }

    #[test]
    fn empty_audio_rejected() {
        let audio = AudioData {
            sample_rate: 16_000,
            samples: vec![],
        };
        let err = detect_voice_activity(&audio, 0.5, 250, 800).unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidInput(InvalidInputError::EmptyInput)
        ));
    }

    #[test]
    fn silence_yields_zero_segments() {
        let audio = AudioData {
            sample_rate: 16_000,
            samples: vec![0.0; 16_000],
        };
        let segments = detect_voice_activity(&audio, 0.5, 250, 800).expect("detect");
        assert!(segments.is_empty());
    }

    #[test]
    fn loud_tone_amid_silence_is_detected() {
        let sample_rate = 16_000;
        let mut samples = vec![0.0f32; sample_rate as usize / 2];
        samples.extend(tone(440.0, 0.8, 0.5, sample_rate));
        samples.extend(vec![0.0f32; sample_rate as usize / 2]);
        let audio = AudioData {
            sample_rate,
            samples,
        };
        let segments = detect_voice_activity(&audio, 0.3, 100, 200).expect("detect");
        assert_eq!(segments.len(), 1);
        assert!(segments[0].start_s < segments[0].end_s);
        assert!(segments[0].start_s > 0.3 && segments[0].start_s < 0.7);
    }

    #[test]
    fn segments_are_sorted_and_non_overlapping() {
        let sample_rate = 16_000;
        let mut samples = tone(440.0, 0.8, 0.3, sample_rate);
        samples.extend(vec![0.0f32; sample_rate as usize]);
        samples.extend(tone(440.0, 0.8, 0.3, sample_rate));
        let audio = AudioData {
            sample_rate,
            samples,
        };
        let segments = detect_voice_activity(&audio, 0.3, 100, 200).expect("detect");
        assert!(segments.len() >= 1);
        for w in segments.windows(2) {
            assert!(w[0].end_s <= w[1].start_s);
            assert!(w[0].start_s < w[0].end_s);
        }
    }

    #[test]
    fn gain_db_interpolates_between_bounds() {
        assert!((gain_db(0.0) - 6.0).abs() < 1e-9);
        assert!((gain_db(1.0) - 24.0).abs() < 1e-9);
        let mid = gain_db(0.5);
        assert!(mid > 6.0 && mid < 24.0);
    }

    #[test]
    fn streaming_segmenter_detects_start_and_close() {
        let sample_rate = 16_000;
        let mut seg = StreamingSegmenter::new(sample_rate, 0.3, 100, 200);
        let loud = tone(440.0, 0.8, 0.3, sample_rate);
        let events = seg.push_samples(&loud);
        assert!(events
            .iter()
            .any(|e| matches!(e, VadEvent::SpeechStarted)));

        let silence = vec![0.0f32; sample_rate as usize];
        let events = seg.push_samples(&silence);
        assert!(events
            .iter()
            .any(|e| matches!(e, VadEvent::SegmentClosed { .. })));
        assert!(!seg.in_speech());
    }
}
