//! Model Lifecycle Manager (C4) — coordinates the registry, download engine,
//! and engine-resident handles behind a single `download`/`delete` surface.
//!
//! §4.4: on `download(model_id)` the manager looks up the catalog entry,
//! checks pins and free disk, delegates to the download engine, and commits
//! the result to the registry. On `delete(model_id)` it must unload any
//! engine-resident handle for that model before removing the file, so an
//! engine never holds a dangling path.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::download::{DownloadEngine, DownloadState, PartialPolicy, ProgressCb};
use crate::error::{AppError, NotFoundError, Result, StateError};
use crate::registry::{DeviceProfile, ModelInfo, ModelKind, Registry, StorageInfo};

/// Implemented by each engine facade (C5) so the lifecycle manager can ask
/// "is this model loaded, and if so, unload it" without depending on any
/// concrete engine type. Breaks the C4 → C5 → C4 cycle the same way the
/// memory pressure supervisor observes C7 rather than holding it (§9).
pub trait EngineRegistry: Send + Sync {
    /// Unload every handle backed by `model_id`, if any are loaded.
    /// Idempotent: a no-op when nothing is loaded for this model.
    fn unload_model(&self, model_id: &str) -> Result<()>;

    /// Whether any handle is currently loaded for `model_id`.
    fn is_model_loaded(&self, model_id: &str) -> bool;

    /// Every model this engine currently has resident, for LRU eviction
    /// under memory pressure (C9).
    fn loaded_models(&self) -> Vec<LoadedModel>;
}

/// A model currently resident in some engine's loaded set.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    /// Catalog id of the loaded model.
    pub model_id: String,
    /// Approximate resident size in bytes.
    pub size_bytes: u64,
    /// When this model was last used for inference (for LRU ordering).
    pub last_used: std::time::Instant,
}

const STALE_TMP_AGE: Duration = Duration::from_secs(24 * 3600);

/// Coordinates C1–C3 plus engine unload on delete/pressure.
pub struct LifecycleManager {
    registry: Arc<Registry>,
    downloads: DownloadEngine,
    engines: Vec<Arc<dyn EngineRegistry>>,
}

impl LifecycleManager {
    /// Construct a manager over an already-open registry and a download
    /// engine with the given concurrency. Engine facades register themselves
    /// via [`Self::register_engine`] so `delete` can unload before removing.
    #[must_use]
    pub fn new(registry: Arc<Registry>, max_concurrent_downloads: usize) -> Self {
        Self {
            registry,
            downloads: DownloadEngine::new(max_concurrent_downloads),
            engines: Vec::new(),
        }
    }

    /// Register an engine facade so its loaded models are unloaded before
    /// `delete` removes their file.
    pub fn register_engine(&mut self, engine: Arc<dyn EngineRegistry>) {
        self.engines.push(engine);
    }

    /// The registry this manager coordinates.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The download engine this manager coordinates (exposed so the memory
    /// pressure supervisor can pause/resume without going through C4).
    #[must_use]
    pub fn downloads(&self) -> &DownloadEngine {
        &self.downloads
    }

    /// Begin downloading `model_id`'s catalog version (the pinned version,
    /// if pinned, else the newest). Returns a download handle the caller can
    /// `snapshot`/`cancel`. Commits to the registry's on-disk layout on
    /// completion; the registry only needs to re-scan `list_downloaded`
    /// afterwards since presence on disk is what defines "downloaded".
    pub async fn download(
        &self,
        model_id: &str,
        progress_cb: Option<ProgressCb>,
    ) -> Result<crate::download::DownloadHandle> {
        let info = self
            .registry
            .get(model_id)
            .ok_or_else(|| NotFoundError::Model(model_id.to_owned()))?;

        let target = self.registry.model_path(&info.model_id, &info.version);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(crate::error::IoError::Disk)?;
        }

        let handle = self
            .downloads
            .submit(
                info.url.clone(),
                target,
                info.size_bytes,
                info.expected_sha256.clone(),
                progress_cb,
                PartialPolicy::KeepPartial,
            )
            .await;

        Ok(handle)
    }

    /// Wait for a submitted download to reach a terminal state, polling its
    /// snapshot, then append an audit entry to `downloads.log` (§6) on every
    /// terminal transition — `Completed`, `Failed`, and `Cancelled` alike.
    pub async fn await_download(
        &self,
        handle: crate::download::DownloadHandle,
        downloads_log: Option<&Path>,
        model_id: &str,
    ) -> Result<()> {
        let sha256 = self
            .registry
            .get(model_id)
            .map(|info| info.expected_sha256)
            .unwrap_or_default();
        loop {
            let record = self
                .downloads
                .snapshot(handle)
                .await
                .ok_or_else(|| AppError::Internal("download handle not found".into()))?;
            match record.state {
                DownloadState::Completed => {
                    if let Some(log_path) = downloads_log {
                        let _ = append_download_log(log_path, &record, &sha256).await;
                    }
                    return Ok(());
                }
                DownloadState::Failed => {
                    if let Some(log_path) = downloads_log {
                        let _ = append_download_log(log_path, &record, &sha256).await;
                    }
                    return Err(AppError::Internal(
                        record.error.unwrap_or_else(|| "download failed".into()),
                    ));
                }
                DownloadState::Cancelled => {
                    if let Some(log_path) = downloads_log {
                        let _ = append_download_log(log_path, &record, &sha256).await;
                    }
                    return Err(AppError::Cancelled);
                }
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    /// Delete a downloaded model, unloading any engine-resident handle for
    /// it first. Succeeds (no-op) if the model was never downloaded.
    pub async fn delete(&self, model_id: &str) -> Result<()> {
        for engine in &self.engines {
            if engine.is_model_loaded(model_id) {
                engine.unload_model(model_id)?;
            }
        }

        let downloaded = self.registry.list_downloaded();
        for entry in downloaded.into_iter().filter(|m| m.model_id == model_id) {
            let path = self.registry.model_path(&entry.model_id, &entry.version);
            if path.exists() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(crate::error::IoError::Disk)?;
            }
        }
        Ok(())
    }

    /// Remove stray `.tmp` files older than 24 hours anywhere under the
    /// registry's storage root — leftovers from a crash mid-download.
    pub async fn cleanup_incomplete(&self) -> Result<usize> {
        let root = self.registry.root().to_path_buf();
        let mut removed = 0usize;
        let mut stack = vec![root];
        let now = SystemTime::now();

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                    continue;
                }
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age >= STALE_TMP_AGE {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        removed += 1;
                        info!(path = %path.display(), "lifecycle: removed stale tmp file");
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Evict a non-pinned model's engine handle and delete its file, used by
    /// the memory pressure supervisor's LRU eviction. Refuses pinned models.
    pub async fn evict(&self, model_id: &str) -> Result<()> {
        if self.registry.is_pinned(model_id) {
            return Err(StateError::AlreadyActive.into());
        }
        self.delete(model_id).await
    }

    /// Non-pinned models currently resident in any registered engine,
    /// ordered least-recently-used first.
    #[must_use]
    pub fn lru_unload_candidates(&self) -> Vec<LoadedModel> {
        let mut candidates: Vec<LoadedModel> = self
            .engines
            .iter()
            .flat_map(|e| e.loaded_models())
            .filter(|m| !self.registry.is_pinned(&m.model_id))
            .collect();
        candidates.sort_by_key(|m| m.last_used);
        candidates
    }

    /// Unload (without deleting the file) every engine handle backed by
    /// `model_id`. Used by pressure-driven eviction, which frees memory but
    /// keeps the on-disk artifact so a future `load` skips re-downloading.
    pub fn unload_model(&self, model_id: &str) -> Result<()> {
        for engine in &self.engines {
            if engine.is_model_loaded(model_id) {
                engine.unload_model(model_id)?;
            }
        }
        Ok(())
    }

    /// Aggregate storage usage across downloaded models. Thin forwarder to
    /// the registry so callers need only hold the lifecycle manager.
    pub fn storage_info(&self) -> Result<StorageInfo> {
        self.registry.storage_info()
    }

    /// Catalog entries suitable for `device`, filtered by kind. Thin
    /// forwarder to the registry so callers need only hold the lifecycle
    /// manager.
    #[must_use]
    pub fn recommend_models(&self, kind: ModelKind, device: &DeviceProfile) -> Vec<ModelInfo> {
        self.registry.recommend(kind, device)
    }
}

/// Appends one NDJSON audit line per terminal download (§6): `handle`,
/// `url`, `target_path`, final `size_bytes`, `sha256`, `state`, and
/// `completed_at`, one object per line so the file can be tailed/parsed
/// without reading the whole thing.
async fn append_download_log(
    log_path: &Path,
    record: &crate::download::DownloadRecord,
    sha256: &str,
) -> Result<()> {
    use tokio::io::AsyncWriteExt as _;
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(crate::error::IoError::Disk)?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
        .map_err(crate::error::IoError::Disk)?;
    let state = match record.state {
        DownloadState::Completed => "completed",
        DownloadState::Failed => "failed",
        DownloadState::Cancelled => "cancelled",
        _ => "unknown",
    };
    let entry = serde_json::json!({
        "handle": record.handle.as_u64(),
        "url": record.url,
        "target_path": record.target_path.display().to_string(),
        "size_bytes": record.bytes_done,
        "sha256": sha256,
        "state": state,
        "completed_at": humantime_epoch(),
    });
    let line = format!("{entry}\n");
    file.write_all(line.as_bytes())
        .await
        .map_err(crate::error::IoError::Disk)?;
    Ok(())
}

fn humantime_epoch() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelKind;
    use std::collections::HashMap;

    fn sample(model_id: &str, version: &str) -> ModelInfo {
        ModelInfo {
            model_id: model_id.to_owned(),
            version: version.to_owned(),
            kind: ModelKind::Llm,
            size_bytes: 0,
            url: "http://unused.invalid/model.bin".to_owned(),
            expected_sha256: String::new(),
            min_compute_class: 0,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn download_unknown_model_fails_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        let manager = LifecycleManager::new(registry, 2);
        let err = manager.download("nonexistent", None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(NotFoundError::Model(_))));
    }

    #[tokio::test]
    async fn download_zero_byte_model_completes_and_commits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        registry.publish(sample("m", "1.0.0")).expect("publish");
        let manager = LifecycleManager::new(Arc::clone(&registry), 2);

        let handle = manager.download("m", None).await.expect("download");
        manager
            .await_download(handle, None, "m")
            .await
            .expect("await");

        let downloaded = registry.list_downloaded();
        assert!(downloaded.iter().any(|m| m.model_id == "m"));
    }

    #[tokio::test]
    async fn await_download_logs_ndjson_entry_on_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        registry.publish(sample("m", "1.0.0")).expect("publish");
        let manager = LifecycleManager::new(Arc::clone(&registry), 2);
        let log_path = dir.path().join("downloads.log");

        let handle = manager.download("m", None).await.expect("download");
        manager
            .await_download(handle, Some(&log_path), "m")
            .await
            .expect("await");

        let contents = tokio::fs::read_to_string(&log_path).await.expect("read log");
        let line = contents.lines().next().expect("one ndjson line");
        let entry: serde_json::Value = serde_json::from_str(line).expect("valid json");
        assert_eq!(entry["handle"], handle.as_u64());
        assert_eq!(entry["state"], "completed");
        assert_eq!(entry["size_bytes"], 0);
        assert!(entry["url"].as_str().is_some());
        assert!(entry["target_path"].as_str().is_some());
        assert!(entry["completed_at"].as_u64().is_some());
    }

    #[tokio::test]
    async fn append_download_log_writes_ndjson_for_every_terminal_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("downloads.log");

        for state in [
            DownloadState::Completed,
            DownloadState::Failed,
            DownloadState::Cancelled,
        ] {
            let record = crate::download::DownloadRecord {
                handle: crate::download::DownloadHandle::for_test(7),
                url: "https://example.invalid/model.bin".to_owned(),
                target_path: dir.path().join("model.bin"),
                tmp_path: dir.path().join("model.bin.tmp"),
                expected_size: 1024,
                bytes_done: if state == DownloadState::Completed {
                    1024
                } else {
                    512
                },
                state,
                error: None,
                attempts: 0,
            };
            append_download_log(&log_path, &record, "deadbeef")
                .await
                .expect("append");
        }

        let contents = tokio::fs::read_to_string(&log_path).await.expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let expected_states = ["completed", "failed", "cancelled"];
        for (line, expected_state) in lines.iter().zip(expected_states) {
            let entry: serde_json::Value = serde_json::from_str(line).expect("valid json");
            assert_eq!(entry["handle"], 7);
            assert_eq!(entry["state"], expected_state);
            assert_eq!(entry["sha256"], "deadbeef");
            assert!(entry["url"].as_str().is_some());
            assert!(entry["target_path"].as_str().is_some());
            assert!(entry["completed_at"].as_u64().is_some());
        }
    }

    #[tokio::test]
    async fn delete_nonexistent_model_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        let manager = LifecycleManager::new(registry, 2);
        manager.delete("never-downloaded").await.expect("noop delete");
    }

    #[tokio::test]
    async fn evict_refuses_pinned_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        registry.publish(sample("m", "1.0.0")).expect("publish");
        registry.pin("m", "1.0.0").expect("pin");
        let manager = LifecycleManager::new(registry, 2);
        let err = manager.evict("m").await.unwrap_err();
        assert!(matches!(err, AppError::State(StateError::AlreadyActive)));
    }

    #[tokio::test]
    async fn cleanup_incomplete_removes_only_stale_tmp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        let manager = LifecycleManager::new(registry, 2);

        let model_dir = dir.path().join("m").join("1.0.0");
        std::fs::create_dir_all(&model_dir).expect("mkdir");
        let fresh_tmp = model_dir.join("model.bin.tmp");
        std::fs::write(&fresh_tmp, b"partial").expect("write");

        let removed = manager.cleanup_incomplete().await.expect("cleanup");
        assert_eq!(removed, 0);
        assert!(fresh_tmp.exists());
    }

    #[tokio::test]
    async fn storage_info_forwards_to_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        let manager = LifecycleManager::new(Arc::clone(&registry), 2);
        let via_manager = manager.storage_info().expect("manager storage_info");
        let via_registry = registry.storage_info().expect("registry storage_info");
        assert_eq!(via_manager.used, via_registry.used);
    }

    #[tokio::test]
    async fn recommend_models_forwards_to_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(dir.path()).expect("open"));
        registry.publish(sample("m", "1.0.0")).expect("publish");
        let manager = LifecycleManager::new(Arc::clone(&registry), 2);
        let device = crate::registry::DeviceProfile {
            ram_bytes: 1_000_000,
            compute_class: 5,
        };
        let recs = manager.recommend_models(ModelKind::Llm, &device);
        assert!(recs.iter().any(|m| m.model_id == "m"));
    }
}
