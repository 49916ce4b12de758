//! Language model engine facade (C5 LLM variant).
//!
//! Wraps GGUF models served by `mistralrs` behind the uniform
//! `load/unload/is_loaded` contract plus `generate`/`generate_stream`/
//! `tokenize`/`detokenize`/`clear_context`/`history` (§4.5). Per-handle
//! conversation history lives here, not in the voice pipeline — C7 only
//! appends `ConversationTurn`s to its own turn sequence; the LLM facade
//! tracks the chat-message-level context a backend needs to keep generating
//! coherently across turns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::LLM_TOKEN_TIMEOUT;
use crate::error::{AppError, InvalidInputError, IoError, NotFoundError, Result};
use crate::handle::{ModelHandle, HANDLES};
use crate::lifecycle::{EngineRegistry, LoadedModel};

/// Incrementally strips `<think>...</think>` blocks across streaming chunks,
/// so chain-of-thought models don't leak reasoning text into the
/// conversation transcript or TTS input.
#[derive(Debug, Default)]
struct ThinkTagStripper {
    in_think_block: bool,
    carry: String,
}

impl ThinkTagStripper {
    const OPEN: &'static str = "<think>";
    const CLOSE: &'static str = "</think>";

    /// Feed one fragment and return newly-visible text (outside think blocks).
    fn push(&mut self, fragment: &str) -> String {
        if fragment.is_empty() {
            return String::new();
        }
        self.carry.push_str(fragment);

        let mut visible = String::new();
        loop {
            if self.in_think_block {
                if let Some(end) = self.carry.find(Self::CLOSE) {
                    self.carry.drain(..end + Self::CLOSE.len());
                    self.in_think_block = false;
                    continue;
                }
                let keep = Self::CLOSE.len().saturating_sub(1);
                if self.carry.len() > keep {
                    let drain = self.carry.len() - keep;
                    self.carry.drain(..drain);
                }
                break;
            }

            if let Some(start) = self.carry.find(Self::OPEN) {
                visible.push_str(&self.carry[..start]);
                self.carry.drain(..start + Self::OPEN.len());
                self.in_think_block = true;
                continue;
            }

            let keep = Self::OPEN.len().max(Self::CLOSE.len()).saturating_sub(1);
            if self.carry.len() > keep {
                let emit = self.carry.len() - keep;
                visible.push_str(&self.carry[..emit]);
                self.carry.drain(..emit);
            }
            break;
        }

        visible
    }

    /// Flush any remaining visible tail.
    fn finish(&mut self) -> String {
        if self.in_think_block {
            self.carry.clear();
            return String::new();
        }
        std::mem::take(&mut self.carry)
    }
}

/// One role-tagged message in a handle's chat history.
#[derive(Debug, Clone)]
struct ChatMessage {
    role: Role,
    content: String,
}

/// Chat role, matching the facade's `history(handle)` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The system prompt.
    System,
    /// The human side of the conversation.
    User,
    /// The model's own prior output.
    Assistant,
}

/// Per-call generation parameters.
#[derive(Debug, Clone)]
pub struct LlmGenConfig {
    /// Maximum tokens to generate for this call.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
}

impl Default for LlmGenConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

#[cfg(feature = "llm-mistralrs")]
struct MistralBackend {
    model: Arc<mistralrs::Model>,
    tokenizer: Option<Arc<tokenizers::Tokenizer>>,
}

struct Loaded {
    #[cfg(feature = "llm-mistralrs")]
    backend: MistralBackend,
    model_id: String,
    size_bytes: u64,
    history: Vec<ChatMessage>,
    last_used: Instant,
}

/// LLM engine facade. Cheap to clone; internal state is `Arc`-shared.
///
/// The loaded-model map is a plain [`std::sync::Mutex`]: every method here
/// locks it only for synchronous bookkeeping and always drops the guard
/// before awaiting anything, so [`EngineRegistry`]'s sync methods can lock
/// it directly instead of bridging into the async runtime.
#[derive(Clone)]
pub struct LlmFacade {
    loaded: Arc<Mutex<HashMap<ModelHandle, Loaded>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Default for LlmFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmFacade {
    /// Construct an empty facade with no models loaded.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaded: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load a GGUF model file and return a handle to it. The parent
    /// directory doubles as the model's local repo id for `mistralrs`, which
    /// resolves a sibling `tokenizer.json` from the same directory when one
    /// is present.
    pub async fn load(&self, path: &Path) -> Result<ModelHandle> {
        if !path.exists() {
            return Err(NotFoundError::File(path.to_path_buf()).into());
        }
        let model_id = model_id_from_path(path);
        let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        #[cfg(feature = "llm-mistralrs")]
        {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    InvalidInputError::ParameterValue(format!(
                        "model path has no filename: {}",
                        path.display()
                    ))
                })?;

            let model = mistralrs::GgufModelBuilder::new(
                dir.to_string_lossy().into_owned(),
                vec![filename.to_owned()],
            )
            .with_logging()
            .build()
            .await
            .map_err(|e| AppError::Internal(format!("GGUF model build failed: {e}")))?;

            let tokenizer_path = dir.join("tokenizer.json");
            let tokenizer = if tokenizer_path.exists() {
                tokenizers::Tokenizer::from_file(&tokenizer_path)
                    .map(Arc::new)
                    .ok()
            } else {
                None
            };

            let handle = HANDLES.issue();
            lock(&self.loaded).insert(
                handle,
                Loaded {
                    backend: MistralBackend {
                        model: Arc::new(model),
                        tokenizer,
                    },
                    model_id,
                    size_bytes,
                    history: Vec::new(),
                    last_used: Instant::now(),
                },
            );
            info!(model_id = %handle, "llm model loaded");
            return Ok(handle);
        }

        #[cfg(not(feature = "llm-mistralrs"))]
        {
            let _ = (model_id, size_bytes);
            Err(AppError::Integrity(crate::error::IntegrityError::UnsupportedFormat(
                "no LLM backend compiled in".to_owned(),
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

    /// Drop the conversation context accumulated for `handle`, starting the
    /// next `generate`/`generate_stream` call from a blank history.
    pub async fn clear_context(&self, handle: ModelHandle) -> Result<()> {
        let mut guard = lock(&self.loaded);
        let loaded = guard
            .get_mut(&handle)
            .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
        loaded.history.clear();
        Ok(())
    }

    /// A deep copy of `handle`'s accumulated chat history.
    pub async fn history(&self, handle: ModelHandle) -> Result<Vec<(Role, String)>> {
        let guard = lock(&self.loaded);
        let loaded = guard
            .get(&handle)
            .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
        Ok(loaded
            .history
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect())
    }

    /// Generate a complete response to `prompt`, blocking until done or
    /// cancelled.
    pub async fn generate(
        &self,
        handle: ModelHandle,
        prompt: &str,
        gen_cfg: &LlmGenConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut text = String::new();
        self.generate_stream(
            handle,
            prompt,
            gen_cfg,
            &mut |chunk, _is_final| text.push_str(chunk),
            cancel,
        )
        .await?;
        Ok(text)
    }

    /// Generate a streaming response to `prompt`, invoking `token_cb` with
    /// each visible fragment (reasoning content stripped) and a final
    /// `is_final = true` call carrying no text. Cancellable; on cancellation
    /// no further callback invocations occur and the partial text already
    /// delivered is not appended to history.
    #[cfg(feature = "llm-mistralrs")]
    pub async fn generate_stream(
        &self,
        handle: ModelHandle,
        prompt: &str,
        gen_cfg: &LlmGenConfig,
        token_cb: &mut dyn FnMut(&str, bool),
        cancel: &CancellationToken,
    ) -> Result<()> {
        use mistralrs::{RequestBuilder, Response, TextMessageRole, TextMessages};
        use tokio_stream::StreamExt as _;

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let model = {
            let mut guard = lock(&self.loaded);
            let loaded = guard
                .get_mut(&handle)
                .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
            loaded.last_used = Instant::now();
            loaded.history.push(ChatMessage {
                role: Role::User,
                content: prompt.to_owned(),
            });
            Arc::clone(&loaded.backend.model)
        };

        let mut messages = TextMessages::new();
        {
            let guard = lock(&self.loaded);
            let loaded = guard
                .get(&handle)
                .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
            for msg in &loaded.history {
                let role = match msg.role {
                    Role::System => TextMessageRole::System,
                    Role::User => TextMessageRole::User,
                    Role::Assistant => TextMessageRole::Assistant,
                };
                messages = messages.add_message(role, &msg.content);
            }
        }

        let request = RequestBuilder::from(messages)
            .set_sampler_temperature(gen_cfg.temperature)
            .set_sampler_topp(gen_cfg.top_p)
            .set_sampler_max_len(gen_cfg.max_tokens as usize);

        let mut stream = model
            .stream_chat_request(request)
            .await
            .map_err(|e| AppError::Internal(format!("stream request failed: {e}")))?;

        let mut generated = String::new();
        let mut stripper = ThinkTagStripper::default();

        loop {
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                timed = tokio::time::timeout(LLM_TOKEN_TIMEOUT, stream.next()) => match timed {
                    Ok(next) => next,
                    Err(_elapsed) => {
                        cancel.cancel();
                        return Err(AppError::Io(IoError::Timeout(LLM_TOKEN_TIMEOUT)));
                    }
                },
            };
            let Some(response) = response else {
                break;
            };

            match response {
                Response::Chunk(chunk) => {
                    if let Some(choice) = chunk.choices.first() {
                        let content = choice.delta.content.as_deref().unwrap_or_default();
                        if content.is_empty() {
                            continue;
                        }
                        let visible = stripper.push(content);
                        if !visible.is_empty() {
                            generated.push_str(&visible);
                            token_cb(&visible, false);
                        }
                    }
                }
                Response::Done(done) => {
                    if let Some(choice) = done.choices.first() {
                        let content = choice.message.content.as_deref().unwrap_or_default();
                        if !content.is_empty() {
                            let visible = stripper.push(content);
                            if !visible.is_empty() {
                                generated.push_str(&visible);
                                token_cb(&visible, false);
                            }
                        }
                    }
                    break;
                }
                Response::ModelError(msg, _) => {
                    return Err(AppError::Internal(format!("model error: {msg}")));
                }
                Response::InternalError(e) => {
                    return Err(AppError::Internal(format!("internal error: {e}")));
                }
                Response::ValidationError(e) => {
                    return Err(AppError::Internal(format!("validation error: {e}")));
                }
                _ => {}
            }
        }

        let tail = stripper.finish();
        if !tail.is_empty() {
            generated.push_str(&tail);
            token_cb(&tail, false);
        }
        token_cb("", true);

        let mut guard = lock(&self.loaded);
        if let Some(loaded) = guard.get_mut(&handle) {
            if !generated.is_empty() {
                loaded.history.push(ChatMessage {
                    role: Role::Assistant,
                    content: generated,
                });
            }
        }
        Ok(())
    }

    #[cfg(not(feature = "llm-mistralrs"))]
    pub async fn generate_stream(
        &self,
        handle: ModelHandle,
        _prompt: &str,
        _gen_cfg: &LlmGenConfig,
        _token_cb: &mut dyn FnMut(&str, bool),
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let _ = handle;
        Err(AppError::Integrity(crate::error::IntegrityError::UnsupportedFormat(
            "no LLM backend compiled in".to_owned(),
        )))
    }

    /// Tokenize `text` with `handle`'s tokenizer, if one was resolved at
    /// load time.
    #[cfg(feature = "llm-mistralrs")]
    pub async fn tokenize(&self, handle: ModelHandle, text: &str) -> Result<Vec<u32>> {
        let guard = lock(&self.loaded);
        let loaded = guard
            .get(&handle)
            .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
        let tokenizer = loaded.backend.tokenizer.as_ref().ok_or_else(|| {
            AppError::Internal("no tokenizer resolved for this model".to_owned())
        })?;
        let encoding = tokenizer
            .encode(text, false)
            .map_err(|e| AppError::Internal(format!("tokenize failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Detokenize `ids` with `handle`'s tokenizer. Round-trips with
    /// [`Self::tokenize`] for any tokenizer-valid id sequence.
    #[cfg(feature = "llm-mistralrs")]
    pub async fn detokenize(&self, handle: ModelHandle, ids: &[u32]) -> Result<String> {
        let guard = lock(&self.loaded);
        let loaded = guard
            .get(&handle)
            .ok_or_else(|| InvalidInputError::ModelHandle(handle.to_string()))?;
        let tokenizer = loaded.backend.tokenizer.as_ref().ok_or_else(|| {
            AppError::Internal("no tokenizer resolved for this model".to_owned())
        })?;
        tokenizer
            .decode(ids, false)
            .map_err(|e| AppError::Internal(format!("detokenize failed: {e}")))
    }
}

impl EngineRegistry for LlmFacade {
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

fn model_id_from_path(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_missing_path_fails_not_found() {
        let facade = LlmFacade::new();
        let err = facade
            .load(Path::new("/nonexistent/model.gguf"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(NotFoundError::File(_))));
    }

    #[tokio::test]
    async fn unknown_handle_is_not_loaded() {
        let facade = LlmFacade::new();
        assert!(!facade.is_loaded(ModelHandle::from_raw(999)).await);
    }

    #[tokio::test]
    async fn clear_context_on_unknown_handle_fails() {
        let facade = LlmFacade::new();
        let err = facade.clear_context(ModelHandle::from_raw(999)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidInput(InvalidInputError::ModelHandle(_))
        ));
    }

    #[test]
    fn think_stripper_passes_plain_text() {
        let mut s = ThinkTagStripper::default();
        let out = s.push("hello world");
        assert_eq!(out, "hell");
        let tail = s.finish();
        assert_eq!(tail, "o world");
    }

    #[test]
    fn think_stripper_removes_inline_block() {
        let mut s = ThinkTagStripper::default();
        let out = s.push("hi <think>hidden</think> there");
        let tail = s.finish();
        assert_eq!(format!("{out}{tail}"), "hi  there");
    }

    #[test]
    fn think_stripper_handles_split_tags() {
        let mut s = ThinkTagStripper::default();
        let a = s.push("pre<thi");
        let b = s.push("nk>hide");
        let c = s.push("n</thin");
        let d = s.push("k>post");
        let tail = s.finish();
        assert_eq!(format!("{a}{b}{c}{d}{tail}"), "prepost");
    }
}
