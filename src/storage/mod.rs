//! Integrity & Storage Accountant.
//!
//! Streaming SHA-256 hashing, free-space probing, and path-safety checks
//! shared by the download engine and model registry. Kept free of any
//! network or registry concerns so it can be unit-tested in isolation.

use std::fmt;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{AppError, IoError, SecurityError};

/// Chunk size used when streaming a file through the hasher.
const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// Streaming SHA-256 of a file's contents, read in 64 KiB chunks so large
/// model files never need to be loaded into memory all at once.
pub fn hash_file(path: &Path) -> Result<[u8; 32], AppError> {
    let mut file = std::fs::File::open(path).map_err(IoError::Disk)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf).map_err(IoError::Disk)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.into())
}

/// Hex-encode a SHA-256 digest for comparison against manifest entries.
#[must_use]
pub fn hex_digest(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Result of comparing a file on disk against an expected checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityResult {
    /// File exists and matches the expected hash (or none was provided).
    Ok,
    /// File does not exist at the given path.
    Missing,
    /// File exists but its SHA-256 digest does not match the expected value.
    Corrupt,
    /// File exists but no expected checksum was provided — verification skipped.
    NoChecksum,
}

impl fmt::Display for IntegrityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Missing => write!(f, "missing"),
            Self::Corrupt => write!(f, "corrupt"),
            Self::NoChecksum => write!(f, "no_checksum"),
        }
    }
}

/// Verify a file against an optional expected SHA-256 hex digest.
#[must_use]
pub fn verify(path: &Path, expected_sha256_hex: Option<&str>) -> IntegrityResult {
    if !path.exists() || !path.is_file() {
        info!(path = %path.display(), "integrity: file missing");
        return IntegrityResult::Missing;
    }

    let Some(expected) = expected_sha256_hex else {
        info!(path = %path.display(), "integrity: no checksum provided, skipping");
        return IntegrityResult::NoChecksum;
    };

    match hash_file(path) {
        Ok(digest) => {
            let actual = hex_digest(&digest);
            if actual.eq_ignore_ascii_case(expected) {
                IntegrityResult::Ok
            } else {
                warn!(path = %path.display(), expected, actual = %actual, "integrity: checksum mismatch");
                IntegrityResult::Corrupt
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "integrity: failed to read file");
            IntegrityResult::Corrupt
        }
    }
}

/// Probe free bytes on the filesystem hosting `dir`.
///
/// `dir` must exist (callers typically pass a storage root created at
/// startup). Uses `statvfs` on Unix platforms via `libc`.
pub fn free_bytes(dir: &Path) -> Result<u64, AppError> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::mem::MaybeUninit;

        let c_path =
            CString::new(dir.as_os_str().as_encoded_bytes()).map_err(|e| {
                AppError::Internal(format!("path contains NUL byte: {e}"))
            })?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: `c_path` is a valid NUL-terminated string for the duration
        // of the call, and `stat` is written in full by a successful call.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(IoError::Disk(io::Error::last_os_error()).into());
        }
        // SAFETY: statvfs returned success, so `stat` is fully initialized.
        let stat = unsafe { stat.assume_init() };
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(u64::MAX)
    }
}

/// Join `base` with a caller-supplied relative path, rejecting traversal.
///
/// Rejects any component that is `..`, an absolute root, or a Windows
/// prefix, then canonicalizes the joined result and checks it still lives
/// under the canonicalized `base` — this additionally closes symlink
/// escapes that pure component-checking would miss.
pub fn safe_join(base: &Path, rel: &Path) -> Result<PathBuf, AppError> {
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(SecurityError::PathTraversal(rel.to_path_buf()).into());
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SecurityError::PathTraversal(rel.to_path_buf()).into());
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    let joined = base.join(rel);

    // The joined path may not exist yet (e.g. a download target). Canonicalize
    // what does exist — base must exist; joined's parent chain is checked
    // component-by-component for symlink escape without requiring the final
    // file to be present.
    let canonical_base = base
        .canonicalize()
        .map_err(|e| AppError::from(IoError::Disk(e)))?;

    let mut probe = canonical_base.clone();
    for component in rel.components() {
        probe.push(component);
        if probe.exists() {
            let canonical_probe = probe
                .canonicalize()
                .map_err(|e| AppError::from(IoError::Disk(e)))?;
            if !canonical_probe.starts_with(&canonical_base) {
                return Err(SecurityError::PathTraversal(rel.to_path_buf()).into());
            }
        }
    }

    Ok(joined)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().expect("create temp file");
        f.write_all(content).expect("write content");
        f
    }

    #[test]
    fn hash_file_matches_known_digest() {
        let f = write_temp(b"hello world");
        let digest = hash_file(f.path()).expect("hash");
        assert_eq!(
            hex_digest(&digest),
            "b94d27b9934d3e08a52e52d7da7dacefbc3ab8bfe8cdf6b9706f4e2cd5e59b5a"
        );
    }

    #[test]
    fn missing_file_returns_missing() {
        let result = verify(Path::new("/nonexistent/path/model.bin"), None);
        assert_eq!(result, IntegrityResult::Missing);
    }

    #[test]
    fn no_checksum_returns_no_checksum() {
        let f = write_temp(b"model data");
        assert_eq!(verify(f.path(), None), IntegrityResult::NoChecksum);
    }

    #[test]
    fn correct_checksum_returns_ok() {
        let content = b"localvox model data test";
        let f = write_temp(content);
        let digest = hash_file(f.path()).expect("hash");
        let expected = hex_digest(&digest);
        assert_eq!(verify(f.path(), Some(&expected)), IntegrityResult::Ok);
    }

    #[test]
    fn wrong_checksum_returns_corrupt() {
        let f = write_temp(b"model data");
        let result = verify(
            f.path(),
            Some("deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"),
        );
        assert_eq!(result, IntegrityResult::Corrupt);
    }

    #[test]
    fn case_insensitive_checksum_comparison() {
        let content = b"case test";
        let f = write_temp(content);
        let digest = hash_file(f.path()).expect("hash");
        let lower = hex_digest(&digest);
        let upper = lower.to_uppercase();
        assert_eq!(verify(f.path(), Some(&lower)), IntegrityResult::Ok);
        assert_eq!(verify(f.path(), Some(&upper)), IntegrityResult::Ok);
    }

    #[test]
    fn safe_join_rejects_parent_dir_component() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = safe_join(tmp.path(), Path::new("../etc/passwd")).unwrap_err();
        assert!(matches!(
            err,
            AppError::Security(SecurityError::PathTraversal(_))
        ));
    }

    #[test]
    fn safe_join_rejects_absolute_component() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = safe_join(tmp.path(), Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(
            err,
            AppError::Security(SecurityError::PathTraversal(_))
        ));
    }

    #[test]
    fn safe_join_accepts_normal_relative_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let joined = safe_join(tmp.path(), Path::new("model_id/1.0.0/model.bin")).expect("join");
        assert!(joined.starts_with(tmp.path()));
    }

    #[test]
    fn free_bytes_is_nonzero_for_tempdir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let free = free_bytes(tmp.path()).expect("free_bytes");
        assert!(free > 0);
    }
}
