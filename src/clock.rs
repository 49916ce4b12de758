//! Shared cancellation and monotonic time.
//!
//! [`CancelToken`] is a thin wrapper over [`tokio_util::sync::CancellationToken`]:
//! `cancel()` is O(1) and idempotent, `is_cancelled()` is wait-free, and
//! [`CancelToken::child`] derives a token that is cancelled whenever its
//! parent is (but not vice versa), matching the propagation rule in the
//! concurrency model. All timeouts and backoff delays are computed against
//! [`std::time::Instant`] — wall-clock time never gates control flow.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A cooperative cancellation flag shared across async boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(CancellationToken);

impl CancelToken {
    /// Create a new, uncancelled root token.
    #[must_use]
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// Derive a child token. Cancelling the parent cancels the child;
    /// cancelling the child does not affect the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self(self.0.child_token())
    }

    /// Request cancellation. Idempotent, returns immediately.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    /// Wait-free check of cancellation state.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once this token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }

    /// Race `fut` against cancellation, returning `None` if cancelled first.
    pub async fn run_until_cancelled<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            () = self.0.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

/// Default timeout applied to STT decode operations (C5/§5).
pub const STT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout applied to a single LLM token (C5/§5).
pub const LLM_TOKEN_TIMEOUT: Duration = Duration::from_secs(15);
/// Default timeout applied to a single TTS chunk synthesis (C5/§5).
pub const TTS_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout applied to download inactivity (C2/§5).
pub const DOWNLOAD_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
