//! Voice Pipeline State Machine (C7).
//!
//! Drives one conversation through `Idle → Listening → Transcribing →
//! Thinking → Speaking → Listening`, with barge-in cancelling whatever
//! `Thinking`/`Speaking` work is in flight and folding its partial output
//! into history as a synthetic `Assistant` turn (§4.7).
//!
//! The state machine runs on a single dedicated task so transitions are
//! serial (§5 "Scheduling model"): every public method is a message sent
//! over a control channel to that task, mirroring the bounded-channel
//! callback style the design notes call for (§9) rather than exposing the
//! history or current state behind a shared lock.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{PipelineConfig, TtsConfig};
use crate::error::{AppError, InvalidInputError, Result, StateError};
use crate::handle::ModelHandle;
use crate::llm::{LlmFacade, LlmGenConfig};
use crate::memory_pressure::TtsQueueFlusher;
use crate::pipeline::messages::{
    split_sentence_chunks, AudioData, ConversationTurn, Role, Transcription,
};
use crate::stt::{SttFacade, SttGenConfig};
use crate::tts::{TtsFacade, TtsGenConfig};
use crate::vad::{StreamingSegmenter, VadEvent};

/// Channel buffer sizes (§5's ordering/backpressure guarantees hold at any
/// bound; these just keep memory use predictable).
const CONTROL_CHANNEL_SIZE: usize = 16;
const AUDIO_EVENT_CHANNEL_SIZE: usize = 8;

/// The pipeline operates on 16 kHz mono internally regardless of what rate
/// the host's audio-input callback delivers (§4.3 `AudioData`).
const PIPELINE_SAMPLE_RATE: u32 = 16_000;

/// Host-visible pipeline state, mirroring §4.7's state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No conversation in progress.
    Idle,
    /// Waiting for a closed speech segment from the audio-input callback.
    Listening,
    /// Running STT over a just-closed segment.
    Transcribing,
    /// Streaming the LLM response.
    Thinking,
    /// Synthesizing and delivering TTS audio for the response.
    Speaking,
}

/// The three loaded engine handles a conversation runs against, bundled so
/// they can be captured once per turn without re-threading four arguments.
#[derive(Clone)]
struct Engines {
    stt: Arc<SttFacade>,
    stt_handle: ModelHandle,
    llm: Arc<LlmFacade>,
    llm_handle: ModelHandle,
    tts: Arc<TtsFacade>,
    tts_handle: ModelHandle,
}

/// Arguments to [`VoicePipeline::configure`].
pub struct ConfigureArgs {
    /// Loaded STT engine to use for this conversation.
    pub stt: Arc<SttFacade>,
    /// Handle returned by [`SttFacade::load`].
    pub stt_handle: ModelHandle,
    /// Loaded LLM engine to use for this conversation.
    pub llm: Arc<LlmFacade>,
    /// Handle returned by [`LlmFacade::load`].
    pub llm_handle: ModelHandle,
    /// Loaded TTS engine to use for this conversation.
    pub tts: Arc<TtsFacade>,
    /// Handle returned by [`TtsFacade::load`].
    pub tts_handle: ModelHandle,
    /// Pipeline behavior parameters (VAD thresholds, barge-in, history cap).
    pub cfg: PipelineConfig,
    /// Default TTS speed/pitch applied to every turn unless a future
    /// per-turn override supersedes them; `tts_voice_id` on `cfg` selects
    /// the voice, these select how it's delivered.
    pub tts_defaults: TtsConfig,
}

/// Arguments to [`VoicePipeline::start_conversation`] — the host's half of
/// every callback in §6, re-expressed as bounded channels (§9).
pub struct StartArgs {
    /// Audio pulled from the microphone, 16 kHz mono or any rate (the
    /// pipeline resamples). An empty buffer signals end-of-stream.
    pub audio_in: mpsc::Receiver<AudioData>,
    /// Synthesized reply audio, pushed to the host in production order.
    pub audio_out: mpsc::Sender<AudioData>,
    /// Full transcript of each closed user utterance.
    pub transcript_cb: mpsc::Sender<String>,
    /// Individual LLM output fragments; `is_final = true` carries no text
    /// and marks the end of one turn's stream.
    pub llm_text_cb: mpsc::UnboundedSender<(String, bool)>,
}

enum Command {
    Configure(ConfigureArgs, oneshot::Sender<Result<()>>),
    StartConversation(StartArgs, oneshot::Sender<Result<()>>),
    Interrupt(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    ClearHistory(oneshot::Sender<()>),
    GetHistory(oneshot::Sender<Vec<ConversationTurn>>),
    GetState(oneshot::Sender<PipelineState>),
    /// Fired by the memory pressure supervisor (C9) under pressure (§4.9);
    /// no reply, best-effort.
    FlushTtsQueue,
}

/// A handle to a running pipeline worker. Cloning shares the same
/// conversation; all methods serialize through the worker's control channel.
#[derive(Clone)]
pub struct VoicePipeline {
    cmd_tx: mpsc::Sender<Command>,
}

impl VoicePipeline {
    /// Spawn the pipeline worker task and return a handle to it.
    #[must_use]
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        tokio::spawn(Worker::new(cmd_rx).run());
        Self { cmd_tx }
    }

    /// Load the engines and behavior parameters for the next conversation.
    /// Only valid in `Idle`; rejects zero handles and out-of-range `cfg`.
    pub async fn configure(&self, args: ConfigureArgs) -> Result<()> {
        self.call(|reply| Command::Configure(args, reply)).await
    }

    /// Begin a conversation. Requires a prior `configure`; transitions
    /// `Idle → Listening`.
    pub async fn start_conversation(&self, args: StartArgs) -> Result<()> {
        self.call(|reply| Command::StartConversation(args, reply))
            .await
    }

    /// Request barge-in from the host side (equivalent to the VAD detecting
    /// a new voiced segment). A no-op outside `Thinking`/`Speaking`,
    /// including on `Idle` — doubling as the idempotent no-op the testable
    /// properties require (§8).
    pub async fn interrupt(&self) -> Result<()> {
        self.call(Command::Interrupt).await
    }

    /// Force a transition to `Idle` from any state, cancelling in-flight
    /// work. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.call(Command::Stop).await
    }

    /// Truncate history. Allowed in any state; does not cancel in-flight
    /// work (§4.7 — this spec's answer to the `clear_history` during
    /// `Speaking` open question is "no interruption").
    pub async fn clear_history(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ClearHistory(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// A deep copy of the current conversation history.
    pub async fn history(&self) -> Vec<ConversationTurn> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetHistory(reply_tx)).await.is_ok() {
            reply_rx.await.unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// The current state, mostly for tests and host-side diagnostics.
    pub async fn state(&self) -> PipelineState {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetState(reply_tx)).await.is_ok() {
            reply_rx.await.unwrap_or(PipelineState::Idle)
        } else {
            PipelineState::Idle
        }
    }

    async fn call<F>(&self, make_cmd: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| AppError::Internal("pipeline worker is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| AppError::Internal("pipeline worker dropped the reply".into()))?
    }
}

impl Default for VoicePipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer hook for the memory pressure supervisor (C9, §4.9 step 2). The
/// supervisor holds this by `Arc<dyn TtsQueueFlusher>`, not a reference to
/// the pipeline itself, breaking the C7↔C9 cycle the same way
/// [`crate::lifecycle::EngineRegistry`] breaks C4↔C5 (§9).
impl TtsQueueFlusher for VoicePipeline {
    fn flush_tts_queue(&self) {
        // Best-effort: a full control channel means a flush is already
        // pending or the worker is mid-shutdown, either of which is fine to
        // drop silently.
        let _ = self.cmd_tx.try_send(Command::FlushTtsQueue);
    }
}

/// Result of racing a stage's primary operation against control commands.
enum ControlOutcome {
    /// Handled locally (e.g. `ClearHistory`, or an `Interrupt` that doesn't
    /// apply in the current stage); keep waiting on the primary operation.
    Continue,
    /// `stop()` or the control channel closed: cancel and go to `Idle`.
    Stop,
    /// Barge-in applies in this stage: cancel and fold partial output into
    /// history, then return to `Listening`.
    Interrupted,
}

enum StageOutcome<T> {
    Done(T),
    Stopped,
    /// The operation failed for a reason other than cancellation; the turn
    /// is abandoned and the pipeline returns to `Listening`.
    Failed,
}

enum ThinkingOutcome {
    /// Sentence-sized chunks ready for TTS, in production order.
    Chunks(Vec<String>),
    Stopped,
    /// Cancelled by barge-in; carries whatever raw text had streamed so far.
    Interrupted(String),
    Failed,
}

enum SpeakingOutcome {
    Done,
    Stopped,
    Interrupted,
    Failed,
}

/// Internal per-conversation audio-ingestion event, produced by a task that
/// continuously drains `audio_in` and runs it through the VAD so barge-in
/// detection keeps working while the state machine is busy in
/// `Transcribing`/`Thinking`/`Speaking` (§4.7).
enum AudioEvent {
    SpeechStarted,
    SegmentClosed(Vec<f32>),
    EndOfStream,
}

/// The state machine itself. Owns history and current state exclusively;
/// never shared outside the worker task (§5 "Shared resources").
struct Worker {
    cmd_rx: mpsc::Receiver<Command>,
    state: PipelineState,
    engines: Option<Engines>,
    cfg: Option<PipelineConfig>,
    tts_defaults: TtsConfig,
    history: Vec<ConversationTurn>,
}

impl Worker {
    fn new(cmd_rx: mpsc::Receiver<Command>) -> Self {
        Self {
            cmd_rx,
            state: PipelineState::Idle,
            engines: None,
            cfg: None,
            tts_defaults: TtsConfig::default(),
            history: Vec::new(),
        }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Configure(args, reply) => {
                    let _ = reply.send(self.do_configure(args));
                }
                Command::StartConversation(args, reply) => match self.begin() {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        self.run_conversation(args).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Command::Interrupt(reply) => {
                    // Idle/no conversation: always a no-op success (§8 law
                    // "double interrupt on Idle is a no-op success").
                    let _ = reply.send(Ok(()));
                }
                Command::Stop(reply) => {
                    // Already Idle: idempotent no-op success.
                    let _ = reply.send(Ok(()));
                }
                Command::ClearHistory(reply) => {
                    self.history.clear();
                    let _ = reply.send(());
                }
                Command::GetHistory(reply) => {
                    let _ = reply.send(self.history.clone());
                }
                Command::GetState(reply) => {
                    let _ = reply.send(self.state);
                }
                Command::FlushTtsQueue => {}
            }
        }
    }

    fn do_configure(&mut self, args: ConfigureArgs) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(StateError::AlreadyActive.into());
        }
        if !args.stt_handle.is_valid() || !args.llm_handle.is_valid() || !args.tts_handle.is_valid()
        {
            return Err(InvalidInputError::ModelHandle(
                "configure requires non-zero stt/llm/tts handles".into(),
            )
            .into());
        }
        args.cfg.validate()?;
        args.tts_defaults.validate()?;
        self.engines = Some(Engines {
            stt: args.stt,
            stt_handle: args.stt_handle,
            llm: args.llm,
            llm_handle: args.llm_handle,
            tts: args.tts,
            tts_handle: args.tts_handle,
        });
        self.cfg = Some(args.cfg);
        self.tts_defaults = args.tts_defaults;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.engines.is_none() || self.cfg.is_none() {
            return Err(StateError::NotConfigured.into());
        }
        if self.state != PipelineState::Idle {
            return Err(StateError::AlreadyActive.into());
        }
        self.state = PipelineState::Listening;
        Ok(())
    }

    /// Drives `Listening → … → Listening` until end-of-stream or `stop()`,
    /// then returns to `Idle`.
    async fn run_conversation(&mut self, args: StartArgs) {
        let StartArgs {
            audio_in,
            audio_out,
            transcript_cb,
            llm_text_cb,
        } = args;

        let cfg = self.cfg.clone().expect("checked in begin()");
        let engines = self.engines.clone().expect("checked in begin()");

        let (event_tx, mut event_rx) = mpsc::channel(AUDIO_EVENT_CHANNEL_SIZE);
        let ingest = tokio::spawn(ingest_audio(
            audio_in,
            event_tx,
            cfg.vad_threshold,
            cfg.min_speech_ms,
            cfg.silence_timeout_ms,
        ));

        'conversation: loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.state = PipelineState::Idle;
                        break 'conversation;
                    };
                    match self.apply_control(cmd, PipelineState::Listening) {
                        ControlOutcome::Continue => {}
                        ControlOutcome::Stop | ControlOutcome::Interrupted => {
                            self.state = PipelineState::Idle;
                            break 'conversation;
                        }
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        None | Some(AudioEvent::EndOfStream) => {
                            self.state = PipelineState::Idle;
                            break 'conversation;
                        }
                        Some(AudioEvent::SpeechStarted) => {
                            // Listening already watches for this; nothing to
                            // do until the segment closes.
                        }
                        Some(AudioEvent::SegmentClosed(samples)) => {
                            if samples.is_empty() {
                                continue 'conversation;
                            }
                            let stopped = self
                                .handle_turn(
                                    samples,
                                    &engines,
                                    &cfg,
                                    &mut event_rx,
                                    &audio_out,
                                    &transcript_cb,
                                    &llm_text_cb,
                                )
                                .await;
                            if stopped {
                                self.state = PipelineState::Idle;
                                break 'conversation;
                            }
                            self.state = PipelineState::Listening;
                        }
                    }
                }
            }
        }

        ingest.abort();
    }

    /// Runs one full `Transcribing → Thinking → Speaking` cycle for a closed
    /// speech segment. Returns `true` if `stop()` was called anywhere along
    /// the way (caller should end the conversation).
    #[allow(clippy::too_many_arguments)]
    async fn handle_turn(
        &mut self,
        samples: Vec<f32>,
        engines: &Engines,
        cfg: &PipelineConfig,
        event_rx: &mut mpsc::Receiver<AudioEvent>,
        audio_out: &mpsc::Sender<AudioData>,
        transcript_cb: &mpsc::Sender<String>,
        llm_text_cb: &mpsc::UnboundedSender<(String, bool)>,
    ) -> bool {
        let audio = AudioData {
            sample_rate: PIPELINE_SAMPLE_RATE,
            samples,
        };

        let transcription = match self.transcribe_stage(&audio, engines).await {
            StageOutcome::Done(t) => t,
            StageOutcome::Stopped => return true,
            StageOutcome::Failed => return false,
        };

        if transcription.text.trim().is_empty() {
            // Nothing to say anything about; back to Listening silently.
            return false;
        }

        let _ = transcript_cb.send(transcription.text.clone()).await;
        self.push_turn(Role::User, transcription.text.clone(), cfg);

        let chunks = match self
            .thinking_stage(&transcription.text, engines, cfg, event_rx, llm_text_cb)
            .await
        {
            ThinkingOutcome::Chunks(chunks) => chunks,
            ThinkingOutcome::Stopped => return true,
            ThinkingOutcome::Interrupted(partial) => {
                if !partial.trim().is_empty() {
                    self.push_turn(Role::Assistant, partial, cfg);
                }
                return false;
            }
            ThinkingOutcome::Failed => return false,
        };

        if chunks.is_empty() {
            return false;
        }

        let (outcome, delivered) = self
            .speaking_stage(&chunks, engines, cfg, event_rx, audio_out)
            .await;
        match outcome {
            SpeakingOutcome::Done => {
                self.push_turn(Role::Assistant, delivered, cfg);
                false
            }
            SpeakingOutcome::Interrupted => {
                if !delivered.trim().is_empty() {
                    self.push_turn(Role::Assistant, delivered, cfg);
                }
                false
            }
            SpeakingOutcome::Stopped => true,
            SpeakingOutcome::Failed => false,
        }
    }

    async fn transcribe_stage(
        &mut self,
        audio: &AudioData,
        engines: &Engines,
    ) -> StageOutcome<Transcription> {
        self.state = PipelineState::Transcribing;
        let cancel = CancellationToken::new();
        let stt_cfg = SttGenConfig { language: None };
        let mut fut = Box::pin(engines.stt.transcribe(engines.stt_handle, audio, &stt_cfg, &cancel));

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        cancel.cancel();
                        return StageOutcome::Stopped;
                    };
                    match self.apply_control(cmd, PipelineState::Transcribing) {
                        ControlOutcome::Continue => continue,
                        ControlOutcome::Stop | ControlOutcome::Interrupted => {
                            cancel.cancel();
                            return StageOutcome::Stopped;
                        }
                    }
                }
                result = &mut fut => {
                    drop(fut);
                    return match result {
                        Ok(t) => StageOutcome::Done(t),
                        Err(AppError::Cancelled) => StageOutcome::Stopped,
                        Err(e) => {
                            warn!("transcription failed: {e}");
                            StageOutcome::Failed
                        }
                    };
                }
            }
        }
    }

    async fn thinking_stage(
        &mut self,
        prompt: &str,
        engines: &Engines,
        cfg: &PipelineConfig,
        event_rx: &mut mpsc::Receiver<AudioEvent>,
        llm_text_cb: &mpsc::UnboundedSender<(String, bool)>,
    ) -> ThinkingOutcome {
        self.state = PipelineState::Thinking;
        let cancel = CancellationToken::new();
        let gen_cfg = LlmGenConfig {
            max_tokens: cfg.llm_max_tokens,
            ..Default::default()
        };

        let accumulated = RefCell::new(String::new());
        let pending = RefCell::new(String::new());
        let closed_chunks = RefCell::new(Vec::<String>::new());

        let mut token_cb = |text: &str, is_final: bool| {
            let _ = llm_text_cb.send((text.to_owned(), is_final));
            if is_final {
                let mut pend = pending.borrow_mut();
                let trimmed = pend.trim().to_owned();
                if !trimmed.is_empty() {
                    closed_chunks.borrow_mut().push(trimmed);
                }
                pend.clear();
                return;
            }
            accumulated.borrow_mut().push_str(text);
            let mut pend = pending.borrow_mut();
            pend.push_str(text);
            let (closed, remainder) = split_sentence_chunks(&pend);
            if !closed.is_empty() {
                closed_chunks.borrow_mut().extend(closed);
                *pend = remainder;
            }
        };

        let mut fut = Box::pin(engines.llm.generate_stream(
            engines.llm_handle,
            prompt,
            &gen_cfg,
            &mut token_cb,
            &cancel,
        ));

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        cancel.cancel();
                        drop(fut);
                        return ThinkingOutcome::Stopped;
                    };
                    match self.apply_control(cmd, PipelineState::Thinking) {
                        ControlOutcome::Continue => continue,
                        ControlOutcome::Stop => {
                            cancel.cancel();
                            drop(fut);
                            return ThinkingOutcome::Stopped;
                        }
                        ControlOutcome::Interrupted => {
                            cancel.cancel();
                            drop(fut);
                            return ThinkingOutcome::Interrupted(accumulated.into_inner());
                        }
                    }
                }
                event = event_rx.recv() => {
                    if matches!(event, Some(AudioEvent::SpeechStarted)) && cfg.enable_barge_in {
                        cancel.cancel();
                        drop(fut);
                        return ThinkingOutcome::Interrupted(accumulated.into_inner());
                    }
                }
                result = &mut fut => {
                    drop(fut);
                    return match result {
                        Ok(()) => {
                            let mut chunks = closed_chunks.into_inner();
                            let remainder = pending.into_inner();
                            if !remainder.trim().is_empty() {
                                chunks.push(remainder.trim().to_owned());
                            }
                            ThinkingOutcome::Chunks(chunks)
                        }
                        Err(AppError::Cancelled) => ThinkingOutcome::Stopped,
                        Err(e) => {
                            warn!("generation failed: {e}");
                            ThinkingOutcome::Failed
                        }
                    };
                }
            }
        }
    }

    async fn speaking_stage(
        &mut self,
        chunks: &[String],
        engines: &Engines,
        cfg: &PipelineConfig,
        event_rx: &mut mpsc::Receiver<AudioEvent>,
        audio_out: &mpsc::Sender<AudioData>,
    ) -> (SpeakingOutcome, String) {
        self.state = PipelineState::Speaking;
        let tts_cfg = TtsGenConfig {
            voice: cfg.tts_voice_id.clone(),
            speed: self.tts_defaults.speed,
            pitch_semitones: self.tts_defaults.pitch_semitones,
        };
        let mut delivered = String::new();

        for chunk_text in chunks {
            let cancel = CancellationToken::new();
            let mut fut = Box::pin(engines.tts.synthesize(engines.tts_handle, chunk_text, &tts_cfg, &cancel));

            let outcome = loop {
                tokio::select! {
                    biased;
                    cmd = self.cmd_rx.recv() => {
                        let Some(cmd) = cmd else {
                            cancel.cancel();
                            break SpeakingOutcome::Stopped;
                        };
                        match self.apply_control(cmd, PipelineState::Speaking) {
                            ControlOutcome::Continue => continue,
                            ControlOutcome::Stop => {
                                cancel.cancel();
                                break SpeakingOutcome::Stopped;
                            }
                            ControlOutcome::Interrupted => {
                                cancel.cancel();
                                break SpeakingOutcome::Interrupted;
                            }
                        }
                    }
                    event = event_rx.recv() => {
                        if matches!(event, Some(AudioEvent::SpeechStarted)) && cfg.enable_barge_in {
                            cancel.cancel();
                            break SpeakingOutcome::Interrupted;
                        }
                    }
                    result = &mut fut => {
                        break match result {
                            Ok(chunk_audio) => {
                                if audio_out.send(chunk_audio).await.is_err() {
                                    SpeakingOutcome::Stopped
                                } else {
                                    if !delivered.is_empty() {
                                        delivered.push(' ');
                                    }
                                    delivered.push_str(chunk_text);
                                    SpeakingOutcome::Done
                                }
                            }
                            Err(AppError::Cancelled) => SpeakingOutcome::Stopped,
                            Err(e) => {
                                warn!("tts synthesis failed: {e}");
                                SpeakingOutcome::Failed
                            }
                        };
                    }
                }
            };

            match outcome {
                SpeakingOutcome::Done => continue,
                other => return (other, delivered),
            }
        }

        (SpeakingOutcome::Done, delivered)
    }

    /// Handle a command that arrived while a stage's primary operation is
    /// in flight. `stage` determines whether `Interrupt`/`FlushTtsQueue`
    /// apply (`Thinking`/`Speaking` only, per §4.7).
    fn apply_control(&mut self, cmd: Command, stage: PipelineState) -> ControlOutcome {
        match cmd {
            Command::Configure(_, reply) => {
                let _ = reply.send(Err(StateError::AlreadyActive.into()));
                ControlOutcome::Continue
            }
            Command::StartConversation(_, reply) => {
                let _ = reply.send(Err(StateError::AlreadyActive.into()));
                ControlOutcome::Continue
            }
            Command::Stop(reply) => {
                let _ = reply.send(Ok(()));
                ControlOutcome::Stop
            }
            Command::Interrupt(reply) => {
                let _ = reply.send(Ok(()));
                if matches!(stage, PipelineState::Thinking | PipelineState::Speaking) {
                    ControlOutcome::Interrupted
                } else {
                    ControlOutcome::Continue
                }
            }
            Command::FlushTtsQueue => {
                if stage == PipelineState::Speaking {
                    ControlOutcome::Interrupted
                } else {
                    ControlOutcome::Continue
                }
            }
            Command::ClearHistory(reply) => {
                self.history.clear();
                let _ = reply.send(());
                ControlOutcome::Continue
            }
            Command::GetHistory(reply) => {
                let _ = reply.send(self.history.clone());
                ControlOutcome::Continue
            }
            Command::GetState(reply) => {
                let _ = reply.send(self.state);
                ControlOutcome::Continue
            }
        }
    }

    /// Appends a turn and trims the oldest pair of turns once the history
    /// exceeds `max_history_turns`, keeping the User-starts-alternating
    /// invariant intact (§8).
    fn push_turn(&mut self, role: Role, text: String, cfg: &PipelineConfig) {
        self.history.push(ConversationTurn {
            role,
            text,
            audio_ref: None,
            timestamp: Instant::now(),
        });
        let max = cfg.max_history_turns.max(1) as usize;
        while self.history.len() > max {
            let drop_n = 2.min(self.history.len());
            self.history.drain(0..drop_n);
        }
    }
}

/// Continuously drains `audio_in`, resampling to 16 kHz and feeding the VAD,
/// translating its events into [`AudioEvent`]s for the state machine. Runs
/// for the whole conversation so barge-in detection works during
/// `Thinking`/`Speaking`, not just `Listening` (§4.7).
async fn ingest_audio(
    mut audio_in: mpsc::Receiver<AudioData>,
    event_tx: mpsc::Sender<AudioEvent>,
    vad_threshold: f32,
    min_speech_ms: u32,
    silence_timeout_ms: u32,
) {
    let mut segmenter = StreamingSegmenter::new(
        PIPELINE_SAMPLE_RATE,
        vad_threshold,
        min_speech_ms,
        silence_timeout_ms,
    );

    while let Some(chunk) = audio_in.recv().await {
        if chunk.is_empty() {
            let _ = event_tx.send(AudioEvent::EndOfStream).await;
            return;
        }

        let samples = if chunk.sample_rate == PIPELINE_SAMPLE_RATE {
            chunk.samples
        } else {
            resample_linear(&chunk.samples, chunk.sample_rate, PIPELINE_SAMPLE_RATE)
        };

        for event in segmenter.push_samples(&samples) {
            let mapped = match event {
                VadEvent::Idle => continue,
                VadEvent::SpeechStarted => AudioEvent::SpeechStarted,
                VadEvent::SegmentClosed { samples } => AudioEvent::SegmentClosed(samples),
            };
            if event_tx.send(mapped).await.is_err() {
                return;
            }
        }
    }
    let _ = event_tx.send(AudioEvent::EndOfStream).await;
}

/// Linear-interpolation resampler, matching the one used for live microphone
/// capture (`crate::audio::capture`) — adequate for speech, whose energy
/// sits well below either rate's Nyquist frequency.
fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };
        out.push(sample as f32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_pipeline_starts_idle() {
        let pipeline = VoicePipeline::new();
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn start_conversation_without_configure_fails_not_configured() {
        let pipeline = VoicePipeline::new();
        let (_audio_tx, audio_in) = mpsc::channel(1);
        let (audio_out, _audio_out_rx) = mpsc::channel(1);
        let (transcript_cb, _t_rx) = mpsc::channel(1);
        let (llm_text_cb, _l_rx) = mpsc::unbounded_channel();

        let result = pipeline
            .start_conversation(StartArgs {
                audio_in,
                audio_out,
                transcript_cb,
                llm_text_cb,
            })
            .await;

        assert!(matches!(
            result,
            Err(AppError::State(StateError::NotConfigured))
        ));
    }

    #[tokio::test]
    async fn interrupt_on_idle_is_a_no_op_success() {
        let pipeline = VoicePipeline::new();
        assert!(pipeline.interrupt().await.is_ok());
        assert!(pipeline.interrupt().await.is_ok());
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn stop_on_idle_is_idempotent() {
        let pipeline = VoicePipeline::new();
        assert!(pipeline.stop().await.is_ok());
        assert!(pipeline.stop().await.is_ok());
    }

    #[tokio::test]
    async fn clear_history_on_fresh_pipeline_is_a_no_op() {
        let pipeline = VoicePipeline::new();
        pipeline.clear_history().await;
        assert!(pipeline.history().await.is_empty());
    }

    #[test]
    fn push_turn_trims_a_full_pair_keeping_user_at_the_head() {
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let mut worker = Worker::new(cmd_rx);
        let cfg = PipelineConfig {
            max_history_turns: 4,
            ..PipelineConfig::default()
        };

        for i in 0..6 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            worker.push_turn(role, format!("turn-{i}"), &cfg);
        }

        assert_eq!(worker.history.len(), 4);
        assert_eq!(worker.history[0].role, Role::User);
        for (i, turn) in worker.history.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(turn.role, expected, "turn {i} should be {expected:?}");
        }

        // One more User turn must not flip the head to Assistant.
        worker.push_turn(Role::User, "turn-6".into(), &cfg);
        assert_eq!(worker.history.len(), 4);
        assert_eq!(worker.history[0].role, Role::User);
    }

    #[test]
    fn resample_linear_is_identity_at_equal_rates() {
        let samples = vec![0.1_f32, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn resample_linear_shrinks_output_when_downsampling() {
        let samples = vec![0.0_f32; 480]; // 30ms at 16kHz
        let out = resample_linear(&samples, 48_000, 16_000);
        assert!(out.len() < samples.len());
    }
}
