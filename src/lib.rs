//! `localvox`: an on-device voice conversation runtime.
//!
//! Orchestrates three inference engines — speech-to-text, a language model,
//! and text-to-speech — into a streaming, interruptible conversation
//! pipeline, and manages the lifecycle of their model artifacts on local
//! storage: discovery, resumable download, integrity verification, pinning,
//! and eviction under memory pressure.
//!
//! # Architecture
//!
//! Two subsystems own the concurrency, cancellation, and partial-failure
//! contracts; everything else is an external collaborator reached through a
//! named interface:
//!
//! - **Voice pipeline** ([`pipeline`]): [`vad`] segments microphone audio,
//!   [`stt`] transcribes it, [`llm`] streams a response, [`tts`] synthesizes
//!   it, with barge-in interruption and conversation history owned by
//!   [`pipeline::coordinator::VoicePipeline`].
//! - **Model lifecycle** ([`lifecycle`]): [`storage`] hashes and accounts for
//!   disk space, [`download`] performs resumable byte-range transfers,
//!   [`registry`] maintains the on-disk catalog and pins, and
//!   [`memory_pressure`] drives LRU eviction when resident memory runs high.
//!
//! [`handle::ModelHandle`] and [`clock::CancelToken`] are shared primitives
//! threaded through both subsystems; [`error::AppError`] is the single error
//! type every public operation returns.

// Fail early with a clear message when the metal feature is enabled but the
// Metal Toolchain is not installed. Without this, mistralrs panics deep in a
// build script with an opaque error.
#[cfg(missing_metal_toolchain)]
compile_error!(
    "The `metal` feature requires Apple's Metal Toolchain. Install it with:\n\n    \
     xcodebuild -downloadComponent MetalToolchain\n\n\
     This is a one-time ~700 MB download."
);

pub mod audio;
pub mod clock;
pub mod config;
pub mod dirs;
pub mod download;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod llm;
pub mod logging;
pub mod memory_pressure;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod stt;
pub mod tts;
pub mod vad;

pub use clock::CancelToken;
pub use config::{PipelineConfig, RuntimeConfig};
pub use error::{AppError, Result};
pub use handle::ModelHandle;
pub use lifecycle::LifecycleManager;
pub use pipeline::coordinator::{PipelineState, VoicePipeline};
pub use registry::Registry;
