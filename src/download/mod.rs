//! Download Engine (C2) — resumable, retried, cancellable byte-range fetch
//! with atomic commit.
//!
//! [`DownloadEngine::submit`] drives the state machine described in §4.2:
//! `Pending → Active → Verifying → Completed`, with `Paused`, `Failed`
//! (retryable up to 3 attempts), and `Cancelled` side states. Each submitted
//! download is owned by its own record behind a per-record lock; the engine
//! itself only holds the record map and a semaphore capping concurrent
//! transfers, matching the "bounded fan-out, default 2 concurrent" scheduling
//! rule in §5.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::clock::CancelToken;
use crate::error::{AppError, IntegrityError, IoError, ResourceError, Result};
use crate::storage;

/// Opaque identifier for a submitted download, distinct from engine
/// [`crate::handle::ModelHandle`]s since a download need not correspond to a
/// loaded model (e.g. cancelled before it's ever loaded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownloadHandle(u64);

impl DownloadHandle {
    /// The raw numeric id, for audit logging (`downloads.log`, §6).
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Construct a handle with a fixed id for tests that need to synthesize
    /// a [`DownloadRecord`] without going through [`DownloadEngine::submit`].
    #[cfg(test)]
    pub(crate) fn for_test(id: u64) -> Self {
        Self(id)
    }
}

static NEXT_DOWNLOAD_HANDLE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_download_handle() -> DownloadHandle {
    DownloadHandle(NEXT_DOWNLOAD_HANDLE.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
}

/// Lifecycle state of a [`DownloadRecord`] (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Submitted but not yet started.
    Pending,
    /// Currently transferring bytes.
    Active,
    /// Paused by memory pressure or an explicit request; resumable.
    Paused,
    /// All bytes written; computing the final SHA-256.
    Verifying,
    /// Verified and committed to `target_path`.
    Completed,
    /// Terminal failure (after exhausting retries, or a permanent error).
    Failed,
    /// Cancelled by the caller; terminal.
    Cancelled,
}

impl DownloadState {
    /// Whether this state is terminal (no further transitions occur).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A point-in-time snapshot of a download's progress and state.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    /// This download's handle.
    pub handle: DownloadHandle,
    /// Source URL.
    pub url: String,
    /// Final destination path on commit.
    pub target_path: PathBuf,
    /// Temp file path while in progress (`target_path` + `.tmp`).
    pub tmp_path: PathBuf,
    /// Declared total size in bytes.
    pub expected_size: u64,
    /// Bytes written to `tmp_path` so far.
    pub bytes_done: u64,
    /// Current lifecycle state.
    pub state: DownloadState,
    /// Error message if `state == Failed`.
    pub error: Option<String>,
    /// Number of retry attempts consumed so far.
    pub attempts: u32,
}

/// Progress callback: invoked with a fraction in `[0.0, 1.0]`.
pub type ProgressCb = Arc<dyn Fn(f64) + Send + Sync>;

/// What to do with a resumable `.tmp` file on terminal failure/cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialPolicy {
    /// Delete the `.tmp` file.
    Delete,
    /// Keep it so a future `submit` with the same `target_path` can resume.
    KeepPartial,
}

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const FSYNC_BOUNDARY_BYTES: u64 = 4 * 1024 * 1024;
const STORAGE_HEADROOM_BYTES: u64 = 1024 * 1024;
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);

struct Inner {
    record: DownloadRecord,
    cancel: CancelToken,
    paused: bool,
    policy: PartialPolicy,
}

/// Resumable download engine. Cheap to clone — internal state is `Arc`-shared.
#[derive(Clone)]
pub struct DownloadEngine {
    client: reqwest::Client,
    records: Arc<Mutex<HashMap<DownloadHandle, Arc<Mutex<Inner>>>>>,
    fanout: Arc<Semaphore>,
}

impl DownloadEngine {
    /// Create an engine with the given maximum number of concurrent transfers.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            records: Arc::new(Mutex::new(HashMap::new())),
            fanout: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Submit a new download, returning immediately with a handle. The
    /// transfer itself runs on a spawned task. `policy` governs what happens
    /// to the `.tmp` file on a terminal `Cancelled`/`Failed` outcome — pass
    /// [`PartialPolicy::KeepPartial`] so a future `submit` for the same
    /// `target` resumes instead of restarting from zero (§4.2 step 6).
    pub async fn submit(
        &self,
        url: impl Into<String>,
        target: impl Into<PathBuf>,
        expected_size: u64,
        expected_sha256_hex: impl Into<String>,
        progress_cb: Option<ProgressCb>,
        policy: PartialPolicy,
    ) -> DownloadHandle {
        let handle = next_download_handle();
        let target_path = target.into();
        let tmp_path = tmp_path_for(&target_path);

        // Resume-detection happens at submission time, not only once the
        // spawned I/O task runs: a caller that snapshots immediately after
        // `submit()` already sees the on-disk partial size (§4.2 supplemental).
        let bytes_done = std::fs::metadata(&tmp_path)
            .map(|meta| meta.len().min(expected_size))
            .unwrap_or(0);

        let record = DownloadRecord {
            handle,
            url: url.into(),
            target_path,
            tmp_path,
            expected_size,
            bytes_done,
            state: DownloadState::Pending,
            error: None,
            attempts: 0,
        };
        let inner = Arc::new(Mutex::new(Inner {
            record,
            cancel: CancelToken::new(),
            paused: false,
            policy,
        }));
        self.records.lock().await.insert(handle, Arc::clone(&inner));

        let expected_sha256_hex = expected_sha256_hex.into();
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .run(handle, inner, expected_sha256_hex, progress_cb)
                .await;
        });

        handle
    }

    /// Cooperatively cancel a download. Returns immediately.
    pub async fn cancel(&self, handle: DownloadHandle) {
        if let Some(inner) = self.records.lock().await.get(&handle).cloned() {
            let guard = inner.lock().await;
            guard.cancel.cancel();
        }
    }

    /// Pause an active download (used by the memory pressure supervisor).
    /// A no-op if the download is not currently `Active`.
    pub async fn pause(&self, handle: DownloadHandle) {
        if let Some(inner) = self.records.lock().await.get(&handle).cloned() {
            let mut guard = inner.lock().await;
            if guard.record.state == DownloadState::Active {
                guard.paused = true;
            }
        }
    }

    /// Resume a previously paused download.
    pub async fn resume(&self, handle: DownloadHandle) {
        if let Some(inner) = self.records.lock().await.get(&handle).cloned() {
            let mut guard = inner.lock().await;
            guard.paused = false;
        }
    }

    /// Snapshot of a record's current state. `None` if the handle is unknown.
    pub async fn snapshot(&self, handle: DownloadHandle) -> Option<DownloadRecord> {
        let inner = self.records.lock().await.get(&handle).cloned()?;
        let guard = inner.lock().await;
        Some(guard.record.clone())
    }

    /// Snapshot every record the engine currently knows about, including
    /// terminal ones (until the caller evicts them).
    pub async fn snapshot_all(&self) -> Vec<DownloadRecord> {
        let records = self.records.lock().await;
        let mut out = Vec::with_capacity(records.len());
        for inner in records.values() {
            out.push(inner.lock().await.record.clone());
        }
        out
    }

    async fn run(
        &self,
        handle: DownloadHandle,
        inner: Arc<Mutex<Inner>>,
        expected_sha256_hex: String,
        progress_cb: Option<ProgressCb>,
    ) {
        let _permit = match self.fanout.acquire().await {
            Ok(p) => p,
            Err(_) => return,
        };

        // Guarantee at least one call at 0.0 regardless of how small the
        // transfer is or whether it resumes from a partial file — the
        // in-loop calls below are rate-limited and may never fire before
        // completion for a single-chunk download (§9 progress callback
        // open question).
        if let Some(cb) = progress_cb.as_ref() {
            cb(0.0);
        }

        loop {
            let (cancel, policy) = {
                let guard = inner.lock().await;
                (guard.cancel.clone(), guard.policy)
            };
            if cancel.is_cancelled() {
                self.finish_cancelled(&inner, policy).await;
                return;
            }

            set_state(&inner, DownloadState::Active).await;
            match self
                .attempt(&inner, &cancel, progress_cb.as_ref())
                .await
            {
                Ok(()) => break,
                Err(AttemptOutcome::Cancelled) => {
                    self.finish_cancelled(&inner, policy).await;
                    return;
                }
                Err(AttemptOutcome::Paused) => {
                    set_state(&inner, DownloadState::Paused).await;
                    // Wait until resumed or cancelled, then loop to retry the transfer.
                    loop {
                        if cancel.is_cancelled() {
                            self.finish_cancelled(&inner, policy).await;
                            return;
                        }
                        let still_paused = inner.lock().await.paused;
                        if !still_paused {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
                Err(AttemptOutcome::Retryable(msg)) => {
                    let attempts = {
                        let mut guard = inner.lock().await;
                        guard.record.attempts += 1;
                        guard.record.attempts
                    };
                    if attempts >= MAX_RETRIES {
                        fail(&inner, msg).await;
                        return;
                    }
                    let backoff = backoff_delay(attempts);
                    warn!(
                        handle = handle.0,
                        attempts,
                        ?backoff,
                        error = %msg,
                        "download: retrying after transient failure"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = cancel.cancelled() => {
                            self.finish_cancelled(&inner, policy).await;
                            return;
                        }
                    }
                }
                Err(AttemptOutcome::Permanent(msg)) => {
                    fail(&inner, msg).await;
                    return;
                }
            }
        }

        // Verifying.
        set_state(&inner, DownloadState::Verifying).await;
        let tmp_path = inner.lock().await.record.tmp_path.clone();
        let target_path = inner.lock().await.record.target_path.clone();
        let digest = match tokio::task::spawn_blocking({
            let tmp_path = tmp_path.clone();
            move || storage::hash_file(&tmp_path)
        })
        .await
        {
            Ok(Ok(digest)) => digest,
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                fail(&inner, e.to_string()).await;
                return;
            }
            Err(e) => {
                fail(&inner, format!("hashing task panicked: {e}")).await;
                return;
            }
        };
        let actual = storage::hex_digest(&digest);
        if !expected_sha256_hex.is_empty() && !actual.eq_ignore_ascii_case(&expected_sha256_hex) {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            let err = AppError::from(IntegrityError::ChecksumMismatch {
                path: tmp_path,
                expected: expected_sha256_hex,
                actual,
            });
            fail(&inner, err.to_string()).await;
            return;
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &target_path).await {
            fail(&inner, format!("commit rename failed: {e}")).await;
            return;
        }

        if let Some(cb) = progress_cb.as_ref() {
            cb(1.0);
        }
        set_state(&inner, DownloadState::Completed).await;
        info!(target = %target_path.display(), "download: committed");
    }

    async fn attempt(
        &self,
        inner: &Arc<Mutex<Inner>>,
        cancel: &CancelToken,
        progress_cb: Option<&ProgressCb>,
    ) -> std::result::Result<(), AttemptOutcome> {
        let (url, target_path, tmp_path, expected_size, mut bytes_done) = {
            let guard = inner.lock().await;
            (
                guard.record.url.clone(),
                guard.record.target_path.clone(),
                guard.record.tmp_path.clone(),
                guard.record.expected_size,
                guard.record.bytes_done,
            )
        };

        // Step 1: stat tmp_path to determine resume point.
        bytes_done = match tokio::fs::metadata(&tmp_path).await {
            Ok(meta) => {
                let size = meta.len();
                if size == expected_size {
                    return self.skip_to_done(inner, size).await;
                } else if size > expected_size {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    0
                } else {
                    size
                }
            }
            Err(_) => 0,
        };
        {
            let mut guard = inner.lock().await;
            guard.record.bytes_done = bytes_done;
        }

        if expected_size == 0 {
            tokio::fs::write(&tmp_path, []).await.map_err(|e| {
                AttemptOutcome::Permanent(format!("failed to create empty tmp file: {e}"))
            })?;
            return Ok(());
        }

        // Step 2: free-space check.
        if let Some(parent) = target_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
            let needed = (expected_size.saturating_sub(bytes_done)) + STORAGE_HEADROOM_BYTES;
            let available = storage::free_bytes(parent).map_err(|e| {
                AttemptOutcome::Permanent(format!("free-space probe failed: {e}"))
            })?;
            if available < needed {
                return Err(AttemptOutcome::Permanent(
                    AppError::from(ResourceError::InsufficientStorage {
                        needed,
                        available,
                    })
                    .to_string(),
                ));
            }
        }

        // Step 3: stream the range request to tmp_path.
        let mut request = self.client.get(&url);
        if bytes_done > 0 {
            request = request.header("Range", format!("bytes={bytes_done}-"));
        }

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(AttemptOutcome::Cancelled),
            r = request.send() => r,
        };
        let response = response.map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptOutcome::Retryable(format!("http {status}")));
        }
        if status.is_client_error() {
            return Err(AttemptOutcome::Permanent(format!("http {status}")));
        }
        if status.is_server_error() {
            return Err(AttemptOutcome::Retryable(format!("http {status}")));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&tmp_path)
            .await
            .map_err(|e| AttemptOutcome::Permanent(format!("failed to open tmp file: {e}")))?;
        file.seek(std::io::SeekFrom::Start(bytes_done))
            .await
            .map_err(|e| AttemptOutcome::Permanent(format!("seek failed: {e}")))?;

        let mut stream = response.bytes_stream();
        let mut since_fsync: u64 = 0;
        let mut last_progress_at = std::time::Instant::now() - PROGRESS_MIN_INTERVAL;
        let mut last_fraction = -1.0f64;

        loop {
            if cancel.is_cancelled() {
                return Err(AttemptOutcome::Cancelled);
            }
            if inner.lock().await.paused {
                let _ = file.flush().await;
                return Err(AttemptOutcome::Paused);
            }

            use tokio_stream::StreamExt as _;
            let next = tokio::time::timeout(
                crate::clock::DOWNLOAD_INACTIVITY_TIMEOUT,
                stream.next(),
            )
            .await;

            let chunk = match next {
                Err(_) => return Err(AttemptOutcome::Retryable("inactivity timeout".into())),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(AttemptOutcome::Retryable(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            use tokio::io::AsyncWriteExt as _;
            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptOutcome::Permanent(format!("disk write failed: {e}")))?;

            bytes_done += chunk.len() as u64;
            since_fsync += chunk.len() as u64;
            {
                let mut guard = inner.lock().await;
                guard.record.bytes_done = bytes_done;
            }

            if since_fsync >= FSYNC_BOUNDARY_BYTES {
                let _ = file.sync_data().await;
                since_fsync = 0;
            }

            if let Some(cb) = progress_cb {
                let fraction = if expected_size == 0 {
                    1.0
                } else {
                    (bytes_done as f64 / expected_size as f64).min(1.0)
                };
                let now = std::time::Instant::now();
                if fraction > last_fraction
                    && (now.duration_since(last_progress_at) >= PROGRESS_MIN_INTERVAL
                        || fraction >= 1.0)
                {
                    cb(fraction);
                    last_progress_at = now;
                    last_fraction = fraction;
                }
            }
        }

        file.sync_all()
            .await
            .map_err(|e| AttemptOutcome::Permanent(format!("final fsync failed: {e}")))?;

        if bytes_done < expected_size {
            return Err(AttemptOutcome::Retryable(format!(
                "truncated: got {bytes_done} of {expected_size} bytes"
            )));
        }

        Ok(())
    }

    async fn skip_to_done(
        &self,
        _inner: &Arc<Mutex<Inner>>,
        _size: u64,
    ) -> std::result::Result<(), AttemptOutcome> {
        Ok(())
    }

    async fn finish_cancelled(&self, inner: &Arc<Mutex<Inner>>, policy: PartialPolicy) {
        let tmp_path = {
            let mut guard = inner.lock().await;
            guard.record.state = DownloadState::Cancelled;
            guard.record.tmp_path.clone()
        };
        if policy == PartialPolicy::Delete {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        info!("download: cancelled");
    }
}

enum AttemptOutcome {
    Cancelled,
    Paused,
    Retryable(String),
    Permanent(String),
}

/// Transient transport failures (§4.2 step 4: connection reset, timeout) are
/// retried; everything else — request/builder errors, TLS failures, body
/// decode errors — is a permanent misconfiguration that retrying cannot fix.
fn classify_transport_error(e: &reqwest::Error) -> AttemptOutcome {
    if e.is_timeout() || e.is_connect() {
        AttemptOutcome::Retryable(e.to_string())
    } else {
        AttemptOutcome::Permanent(e.to_string())
    }
}

async fn set_state(inner: &Arc<Mutex<Inner>>, state: DownloadState) {
    inner.lock().await.record.state = state;
}

async fn fail(inner: &Arc<Mutex<Inner>>, message: String) {
    let tmp_path = {
        let mut guard = inner.lock().await;
        guard.record.state = DownloadState::Failed;
        guard.record.error = Some(message.clone());
        guard.record.tmp_path.clone()
    };
    warn!(error = %message, "download: failed");
    let policy = inner.lock().await.policy;
    if policy == PartialPolicy::Delete {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(BACKOFF_CAP);
    let jitter_frac = rand::thread_rng().gen_range(-0.25f64..=0.25);
    let millis = (capped.as_millis() as f64) * (1.0 + jitter_frac);
    Duration::from_millis(millis.max(0.0) as u64)
}

fn tmp_path_for(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_appends_suffix() {
        let target = PathBuf::from("/store/model/1.0.0/model.bin");
        let tmp = tmp_path_for(&target);
        assert_eq!(tmp, PathBuf::from("/store/model/1.0.0/model.bin.tmp"));
    }

    #[test]
    fn backoff_delay_is_capped_and_nonzero() {
        for attempt in 1..=5 {
            let d = backoff_delay(attempt);
            assert!(d <= BACKOFF_CAP + Duration::from_millis(BACKOFF_CAP.as_millis() as u64 / 4 + 1));
        }
    }

    #[test]
    fn download_state_terminal_classification() {
        assert!(DownloadState::Completed.is_terminal());
        assert!(DownloadState::Failed.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(!DownloadState::Active.is_terminal());
        assert!(!DownloadState::Paused.is_terminal());
        assert!(!DownloadState::Pending.is_terminal());
        assert!(!DownloadState::Verifying.is_terminal());
    }

    #[tokio::test]
    async fn submit_zero_size_completes_without_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("empty.bin");
        let engine = DownloadEngine::new(2);
        let handle = engine
            .submit("http://unused.invalid/empty", &target, 0, "", None, PartialPolicy::Delete)
            .await;

        let mut record = engine.snapshot(handle).await.expect("record exists");
        for _ in 0..200 {
            if record.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = engine.snapshot(handle).await.expect("record exists");
        }
        assert_eq!(record.state, DownloadState::Completed);
        assert!(target.exists());
        assert_eq!(std::fs::metadata(&target).expect("meta").len(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let engine = DownloadEngine::new(1);
        let handle = engine
            .submit("http://10.255.255.1/model.bin", &target, 1024, "", None, PartialPolicy::Delete)
            .await;
        engine.cancel(handle).await;
        engine.cancel(handle).await;
        for _ in 0..200 {
            let record = engine.snapshot(handle).await.expect("record exists");
            if record.state.is_terminal() {
                assert_eq!(record.state, DownloadState::Cancelled);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn resume_detection_reflects_partial_file_before_first_poll() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let tmp = tmp_path_for(&target);
        std::fs::write(&tmp, vec![0u8; 512]).expect("seed partial tmp");

        let engine = DownloadEngine::new(1);
        let handle = engine
            .submit("http://10.255.255.1/model.bin", &target, 1024, "", None, PartialPolicy::Delete)
            .await;

        // The very first snapshot, taken before the spawned task has had a
        // chance to run, already reflects the on-disk partial size.
        let record = engine.snapshot(handle).await.expect("record exists");
        assert_eq!(record.bytes_done, 512);

        engine.cancel(handle).await;
    }
}

/// HTTP-layer tests driving the engine against a local `wiremock` server
/// instead of a real network, per the ambient test-tooling stack (§1).
#[cfg(test)]
mod http_tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn wait_terminal(engine: &DownloadEngine, handle: DownloadHandle) -> DownloadRecord {
        for _ in 0..500 {
            let record = engine.snapshot(handle).await.expect("record exists");
            if record.state.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download did not reach a terminal state in time");
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        use sha2::{Digest as _, Sha256};
        let digest = Sha256::digest(bytes);
        storage::hex_digest(&digest.into())
    }

    #[tokio::test]
    async fn completes_and_commits_when_checksum_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let body = b"the quick brown fox jumps over the lazy dog".to_vec();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let engine = DownloadEngine::new(1);
        let url = format!("{}/model.bin", server.uri());
        let handle = engine
            .submit(url, &target, body.len() as u64, sha256_hex(&body), None, PartialPolicy::Delete)
            .await;

        let record = wait_terminal(&engine, handle).await;
        assert_eq!(record.state, DownloadState::Completed);
        assert_eq!(std::fs::read(&target).expect("read target"), body);
        assert!(!record.tmp_path.exists());
    }

    #[tokio::test]
    async fn resumes_with_range_header_from_existing_partial_tmp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let tmp = tmp_path_for(&target);

        let full: Vec<u8> = (0u32..2048).map(|b| (b % 256) as u8).collect();
        std::fs::write(&tmp, &full[..1024]).expect("seed partial tmp");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .and(wiremock::matchers::header("Range", "bytes=1024-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(full[1024..].to_vec()))
            .mount(&server)
            .await;

        let engine = DownloadEngine::new(1);
        let url = format!("{}/model.bin", server.uri());
        let handle = engine
            .submit(url, &target, full.len() as u64, sha256_hex(&full), None, PartialPolicy::Delete)
            .await;

        let record = wait_terminal(&engine, handle).await;
        assert_eq!(record.state, DownloadState::Completed);
        assert_eq!(std::fs::read(&target).expect("read target"), full);
    }

    #[tokio::test]
    async fn retries_transient_server_error_then_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let body = b"retry me after a 503".to_vec();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let engine = DownloadEngine::new(1);
        let url = format!("{}/model.bin", server.uri());
        let handle = engine
            .submit(url, &target, body.len() as u64, sha256_hex(&body), None, PartialPolicy::Delete)
            .await;

        let record = wait_terminal(&engine, handle).await;
        assert_eq!(record.state, DownloadState::Completed);
        assert_eq!(std::fs::read(&target).expect("read target"), body);
    }

    #[tokio::test]
    async fn permanent_client_error_fails_without_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let engine = DownloadEngine::new(1);
        let url = format!("{}/model.bin", server.uri());
        let handle = engine.submit(url, &target, 10, "", None, PartialPolicy::Delete).await;

        let record = wait_terminal(&engine, handle).await;
        assert_eq!(record.state, DownloadState::Failed);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn keep_partial_policy_preserves_tmp_file_on_permanent_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let tmp = tmp_path_for(&target);
        std::fs::write(&tmp, vec![0u8; 256]).expect("seed partial tmp");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let engine = DownloadEngine::new(1);
        let url = format!("{}/model.bin", server.uri());
        let handle = engine
            .submit(url, &target, 1024, "", None, PartialPolicy::KeepPartial)
            .await;

        let record = wait_terminal(&engine, handle).await;
        assert_eq!(record.state, DownloadState::Failed);
        assert!(tmp.exists());
    }

    #[tokio::test]
    async fn keep_partial_policy_preserves_tmp_file_on_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let tmp = tmp_path_for(&target);
        std::fs::write(&tmp, vec![0u8; 256]).expect("seed partial tmp");

        let engine = DownloadEngine::new(1);
        let handle = engine
            .submit(
                "http://10.255.255.1/model.bin",
                &target,
                1024,
                "",
                None,
                PartialPolicy::KeepPartial,
            )
            .await;
        engine.cancel(handle).await;

        for _ in 0..200 {
            let record = engine.snapshot(handle).await.expect("record exists");
            if record.state.is_terminal() {
                assert_eq!(record.state, DownloadState::Cancelled);
                assert!(tmp.exists());
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn progress_reports_zero_then_one_for_a_single_chunk_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let body = b"tiny".to_vec();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let fractions: Arc<std::sync::Mutex<Vec<f64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&fractions);
        let cb: ProgressCb = Arc::new(move |f| {
            recorded.lock().unwrap_or_else(|e| e.into_inner()).push(f);
        });

        let engine = DownloadEngine::new(1);
        let url = format!("{}/model.bin", server.uri());
        let handle = engine
            .submit(url, &target, body.len() as u64, sha256_hex(&body), Some(cb), PartialPolicy::Delete)
            .await;

        let record = wait_terminal(&engine, handle).await;
        assert_eq!(record.state, DownloadState::Completed);

        let seen = fractions.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(seen.first().copied(), Some(0.0));
        assert_eq!(seen.last().copied(), Some(1.0));
        for w in seen.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_removes_tmp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("model.bin");
        let body = b"server returns the wrong bytes entirely".to_vec();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let engine = DownloadEngine::new(1);
        let url = format!("{}/model.bin", server.uri());
        let bogus_hash = "0".repeat(64);
        let handle = engine
            .submit(url, &target, body.len() as u64, bogus_hash, None, PartialPolicy::Delete)
            .await;

        let record = wait_terminal(&engine, handle).await;
        assert_eq!(record.state, DownloadState::Failed);
        assert!(!record.tmp_path.exists());
        assert!(!target.exists());
    }
}
