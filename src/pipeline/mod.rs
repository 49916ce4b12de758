//! The voice pipeline: shared value types (§4.3/§4.5) and the state machine
//! that drives STT → LLM → TTS for one conversation (§4.7).

pub mod coordinator;
pub mod messages;
