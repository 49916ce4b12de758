//! Error taxonomy for the runtime.
//!
//! [`AppError`] is the crate-wide error type. Each top-level kind wraps a
//! kind-specific inner enum so callers can match on kind and sub-kind without
//! parsing strings. Component boundaries return [`Result`]; only
//! [`IoError::Network`] and [`IoError::Timeout`] are retried locally by the
//! download engine (see [`crate::download`]) — every other variant is
//! terminal at the point it's raised.

use std::path::PathBuf;

/// Convenience result type used across the crate.
pub type Result<T> = std::result::Result<T, AppError>;

/// Top-level error kind.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A caller-supplied argument failed validation.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// A requested entity does not exist.
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// On-disk data failed an integrity check.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// A resource limit was exceeded.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// An I/O operation failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// The caller invoked an operation the current state doesn't allow.
    #[error(transparent)]
    State(#[from] StateError),

    /// The operation was cancelled via its [`crate::clock::CancelToken`].
    #[error("operation cancelled")]
    Cancelled,

    /// A security boundary was violated.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// An invariant was violated internally, or a host callback panicked.
    #[error("internal error: {0}")]
    Internal(String),
}

/// `InvalidInput` sub-kinds.
#[derive(Debug, thiserror::Error)]
pub enum InvalidInputError {
    /// A required pointer/handle-shaped argument was null/zero.
    #[error("null pointer or zero handle: {0}")]
    NullPointer(String),

    /// A parameter value was outside its documented domain.
    #[error("invalid parameter value: {0}")]
    ParameterValue(String),

    /// A configuration value failed validation at load time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A `ModelHandle` did not reference a currently loaded model.
    #[error("invalid model handle: {0}")]
    ModelHandle(String),

    /// Audio input was empty where content was required.
    #[error("empty audio input")]
    EmptyInput,
}

/// `NotFound` sub-kinds.
#[derive(Debug, thiserror::Error)]
pub enum NotFoundError {
    /// No registry entry exists for the given model id.
    #[error("model not found: {0}")]
    Model(String),

    /// A file expected on disk was absent.
    #[error("file not found: {0}")]
    File(PathBuf),
}

/// `Integrity` sub-kinds.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// The computed SHA-256 did not match the expected digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Path of the file that was hashed.
        path: PathBuf,
        /// Expected hex-encoded SHA-256 digest.
        expected: String,
        /// Actual hex-encoded SHA-256 digest.
        actual: String,
    },

    /// A file was shorter than its expected size.
    #[error("truncated file: {0}")]
    TruncatedFile(PathBuf),

    /// A model file's format could not be recognized by any engine.
    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),
}

/// `Resource` sub-kinds.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// The target filesystem did not have enough free space.
    #[error("insufficient storage: need {needed} bytes, {available} available")]
    InsufficientStorage {
        /// Bytes required to complete the operation.
        needed: u64,
        /// Bytes actually free.
        available: u64,
    },

    /// An engine failed to allocate memory for a model.
    #[error("out of memory loading model")]
    OutOfMemory,

    /// Too many concurrent file handles were open.
    #[error("too many open files")]
    TooManyOpenFiles,
}

/// `Io` sub-kinds.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// A network request failed (connection reset, DNS, transport error).
    #[error("network error: {0}")]
    Network(String),

    /// A local disk read/write failed.
    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    /// An operation exceeded its configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// `State` sub-kinds.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// An operation that requires `configure()` first was called before it.
    #[error("not configured")]
    NotConfigured,

    /// An operation that requires idle/inactive state found one already active.
    #[error("already active")]
    AlreadyActive,

    /// An operation was attempted after shutdown.
    #[error("already shut down")]
    AlreadyShutdown,
}

/// `Security` sub-kinds.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// A relative path attempted to escape its base directory.
    #[error("path traversal rejected: {0}")]
    PathTraversal(PathBuf),

    /// A download source was not on the configured allow-list.
    #[error("untrusted source: {0}")]
    UntrustedSource(String),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(IoError::Disk(err))
    }
}
