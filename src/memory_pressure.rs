//! Memory Pressure Supervisor (C9).
//!
//! Consumes three inputs (§4.9): a host-provided "memory warning" push
//! notification, a periodic sample of this process's resident set size, and
//! an explicit [`MemoryPressureSupervisor::set_memory_limit`]. Pressure is
//! active whenever `resident > 0.85 × limit` (a `limit` of `0` means "never
//! pressured" — useful for hosts that haven't wired up a budget yet). While
//! pressured the supervisor asks the lifecycle manager (C4) to unload LRU
//! non-pinned models until resident drops to `0.60 × limit` or candidates
//! run out, tells the pipeline (C7) to flush its TTS queue, and pauses
//! active downloads (C2), resuming them once pressure clears.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::download::DownloadState;
use crate::lifecycle::LifecycleManager;

/// Fraction of `limit` at which pressure engages.
pub const PRESSURE_ENGAGE_FRACTION: f64 = 0.85;
/// Fraction of `limit` eviction targets before stopping.
pub const PRESSURE_RELIEVE_FRACTION: f64 = 0.60;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Implemented by the voice pipeline (C7) so the supervisor can flush queued
/// TTS audio without holding a reference to the whole pipeline (§9 — the
/// supervisor is an observer, not an owner).
pub trait TtsQueueFlusher: Send + Sync {
    /// Drop any buffered-but-not-yet-played TTS audio.
    fn flush_tts_queue(&self);
}

/// An event emitted whenever the pressure state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureTransition {
    /// Entered pressure (resident crossed above the engage threshold).
    Engaged,
    /// Exited pressure (resident dropped back at/under the engage threshold
    /// after eviction, or the limit was raised/cleared).
    Cleared,
}

/// Observes resident memory and drives eviction/pause under pressure.
pub struct MemoryPressureSupervisor {
    limit_bytes: AtomicU64,
    lifecycle: Arc<LifecycleManager>,
    tts: Option<Arc<dyn TtsQueueFlusher>>,
    transitions: broadcast::Sender<PressureTransition>,
    pressured: watch::Sender<bool>,
    paused_downloads: tokio::sync::Mutex<Vec<crate::download::DownloadHandle>>,
}

impl MemoryPressureSupervisor {
    /// Create a supervisor with an initial limit (`0` disables pressure).
    #[must_use]
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        tts: Option<Arc<dyn TtsQueueFlusher>>,
        limit_bytes: u64,
    ) -> Self {
        let (transitions, _rx) = broadcast::channel(16);
        let (pressured, _rx2) = watch::channel(false);
        Self {
            limit_bytes: AtomicU64::new(limit_bytes),
            lifecycle,
            tts,
            transitions,
            pressured,
            paused_downloads: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Update the resident-memory limit in bytes. `0` disables pressure.
    pub fn set_memory_limit(&self, bytes: u64) {
        self.limit_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Current limit in bytes.
    #[must_use]
    pub fn memory_limit(&self) -> u64 {
        self.limit_bytes.load(Ordering::Relaxed)
    }

    /// Subscribe to pressure engage/clear transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PressureTransition> {
        self.transitions.subscribe()
    }

    /// Whether pressure is currently active.
    #[must_use]
    pub fn is_pressured(&self) -> bool {
        *self.pressured.borrow()
    }

    /// Host-provided "memory warning" push notification — treated as an
    /// immediate request to evaluate pressure using the latest resident
    /// sample, without waiting for the next poll tick.
    pub async fn on_host_memory_warning(&self) {
        let resident = resident_bytes();
        self.evaluate(resident).await;
    }

    /// Run the periodic resident-memory sampler until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("memory pressure supervisor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("memory pressure supervisor stopped");
                    break;
                }
                () = tokio::time::sleep(POLL_INTERVAL) => {
                    let resident = resident_bytes();
                    self.evaluate(resident).await;
                }
            }
        }
    }

    async fn evaluate(&self, resident: u64) {
        let limit = self.memory_limit();
        if limit == 0 {
            return;
        }
        let engage_at = (limit as f64 * PRESSURE_ENGAGE_FRACTION) as u64;
        let relieve_at = (limit as f64 * PRESSURE_RELIEVE_FRACTION) as u64;

        let was_pressured = self.is_pressured();
        let now_pressured = resident > engage_at;

        if now_pressured && !was_pressured {
            let _ = self.pressured.send(true);
            let _ = self.transitions.send(PressureTransition::Engaged);
            warn!(resident, limit, "memory pressure: engaged");
            self.on_pressure_engaged(relieve_at).await;
        } else if now_pressured {
            // Still pressured — keep evicting in case the first pass didn't
            // reach the relief target (e.g. new models loaded meanwhile).
            self.on_pressure_engaged(relieve_at).await;
        } else if was_pressured {
            let _ = self.pressured.send(false);
            let _ = self.transitions.send(PressureTransition::Cleared);
            info!(resident, limit, "memory pressure: cleared");
            self.resume_downloads().await;
        }
    }

    async fn on_pressure_engaged(&self, relieve_at: u64) {
        if let Some(tts) = &self.tts {
            tts.flush_tts_queue();
        }
        self.pause_active_downloads().await;
        self.evict_until(relieve_at);
    }

    fn evict_until(&self, relieve_at: u64) {
        let candidates = self.lifecycle.lru_unload_candidates();
        let mut freed = 0u64;
        let mut current = resident_bytes();
        for candidate in candidates {
            if current <= relieve_at {
                break;
            }
            match self.lifecycle.unload_model(&candidate.model_id) {
                Ok(()) => {
                    freed += candidate.size_bytes;
                    current = current.saturating_sub(candidate.size_bytes);
                    info!(model_id = %candidate.model_id, size_bytes = candidate.size_bytes, "memory pressure: evicted LRU model");
                }
                Err(e) => {
                    warn!(model_id = %candidate.model_id, error = %e, "memory pressure: eviction failed");
                }
            }
        }
        if freed == 0 {
            warn!("memory pressure: no eviction candidates remain");
        }
    }

    async fn pause_active_downloads(&self) {
        let downloads = self.lifecycle.downloads();
        let mut paused = self.paused_downloads.lock().await;
        for record in downloads.snapshot_all().await {
            if record.state == DownloadState::Active {
                downloads.pause(record.handle).await;
                paused.push(record.handle);
            }
        }
    }

    async fn resume_downloads(&self) {
        let downloads = self.lifecycle.downloads();
        let mut paused = self.paused_downloads.lock().await;
        for handle in paused.drain(..) {
            downloads.resume(handle).await;
        }
    }
}

/// This process's resident set size, in bytes.
///
/// Uses `getrusage(RUSAGE_SELF)`'s `ru_maxrss`, which is KiB on Linux and
/// bytes on macOS/BSD — normalized here to bytes.
#[must_use]
pub fn resident_bytes() -> u64 {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let mut usage = MaybeUninit::<libc::rusage>::uninit();
        // SAFETY: `usage` is fully written by a successful getrusage call.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return 0;
        }
        // SAFETY: getrusage returned success.
        let usage = unsafe { usage.assume_init() };
        let raw = usage.ru_maxrss.max(0) as u64;
        #[cfg(target_os = "macos")]
        {
            raw
        }
        #[cfg(not(target_os = "macos"))]
        {
            raw.saturating_mul(1024)
        }
    }
    #[cfg(not(unix))]
    {
        0
    }
}
