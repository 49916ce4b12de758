//! Opaque model handles shared by every engine facade.
//!
//! A [`ModelHandle`] is a 64-bit identifier issued monotonically whenever a
//! model is loaded into an engine. Zero is reserved for "invalid" so a
//! handle can be stored in a plain `u64` at language boundaries without an
//! extra validity flag. Handles are unique across all engine kinds — the
//! same counter backs STT, LLM, and TTS loads — which is what makes the
//! "a handle appears in at most one engine's loaded set" invariant checkable
//! without cross-engine coordination.

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque per-load identifier issued by an engine facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelHandle(u64);

impl ModelHandle {
    /// The reserved "invalid" handle. No successful `load()` ever returns this.
    pub const INVALID: ModelHandle = ModelHandle(0);

    /// Wrap a raw value, e.g. when crossing an FFI boundary.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this handle is anything other than the reserved invalid value.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

/// Monotonic handle issuer shared by every engine facade instance in the
/// process, so handles stay globally unique without cross-engine locking.
#[derive(Debug, Default)]
pub struct HandleIssuer {
    next: AtomicU64,
}

impl HandleIssuer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Issue the next handle. Never returns [`ModelHandle::INVALID`].
    pub fn issue(&self) -> ModelHandle {
        ModelHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process-wide handle issuer, used by every concrete engine facade.
pub static HANDLES: HandleIssuer = HandleIssuer::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_handle_is_zero_and_invalid() {
        assert_eq!(ModelHandle::INVALID.raw(), 0);
        assert!(!ModelHandle::INVALID.is_valid());
    }

    #[test]
    fn issuer_is_monotonic_and_never_zero() {
        let issuer = HandleIssuer::new();
        let a = issuer.issue();
        let b = issuer.issue();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert!(b.raw() > a.raw());
    }
}
