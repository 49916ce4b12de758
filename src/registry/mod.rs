//! Model Registry (C3) — local catalog of available/downloaded models,
//! version pins, and storage accounting.
//!
//! The manifest (`<storage>/registry.json`) is the single source of truth on
//! disk; an in-memory `Arc<Manifest>` snapshot serves every read so
//! `list_*` calls never block a concurrent writer (§5). Writers replace the
//! `Arc` under a short-lived lock and then persist via temp-file + rename so
//! a crash mid-write never corrupts the manifest a reader already has
//! committed to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, InvalidInputError, IoError, NotFoundError, Result};

/// Which of the three engines a model targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelKind {
    /// Large language model.
    Llm,
    /// Speech-to-text.
    Stt,
    /// Text-to-speech.
    Tts,
}

/// A device's resource envelope, used by [`Registry::recommend`].
#[derive(Debug, Clone, Copy)]
pub struct DeviceProfile {
    /// Total system RAM in bytes.
    pub ram_bytes: u64,
    /// A coarse acceleration tier; higher is more capable.
    pub compute_class: u32,
}

/// Immutable catalog entry, published once by the registry and never
/// mutated in place — updates arrive as a new [`ModelInfo`] with a newer
/// `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Stable identifier, e.g. `"parakeet-tdt-multilingual"`.
    pub model_id: String,
    /// Semver version string.
    pub version: String,
    /// Target engine kind.
    pub kind: ModelKind,
    /// Size of the model file in bytes.
    pub size_bytes: u64,
    /// Source URL for download.
    pub url: String,
    /// Expected SHA-256 digest, hex-encoded (64 chars).
    pub expected_sha256: String,
    /// Minimum device compute class this model requires.
    #[serde(default)]
    pub min_compute_class: u32,
    /// Free-form catalog metadata (display name, language list, license, …).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ModelInfo {
    fn parsed_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }
}

/// On-disk manifest shape (`<storage>/registry.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    schema: u32,
    models: Vec<ModelInfo>,
    pins: HashMap<String, String>,
    /// Fields the core doesn't know about, round-tripped verbatim so a
    /// newer host application's additions survive a rewrite by this core.
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

const CURRENT_SCHEMA: u32 = 1;

/// Aggregate storage accounting (§4.3 `storage_info`).
#[derive(Debug, Clone)]
pub struct StorageInfo {
    /// Bytes currently used by downloaded model files.
    pub used: u64,
    /// Bytes free on the filesystem hosting the storage root.
    pub available: u64,
    /// Per-model byte usage, keyed by `model_id`.
    pub per_model_bytes: HashMap<String, u64>,
}

/// The local model catalog and download index.
pub struct Registry {
    root: PathBuf,
    manifest_path: PathBuf,
    manifest: RwLock<std::sync::Arc<Manifest>>,
}

impl Registry {
    /// Open (creating if absent) the registry manifest under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(IoError::Disk)?;
        let manifest_path = root.join("registry.json");

        let manifest = if manifest_path.exists() {
            let text = std::fs::read_to_string(&manifest_path).map_err(IoError::Disk)?;
            serde_json::from_str(&text).map_err(|e| {
                AppError::InvalidInput(InvalidInputError::Configuration(format!(
                    "malformed registry manifest: {e}"
                )))
            })?
        } else {
            Manifest {
                schema: CURRENT_SCHEMA,
                ..Default::default()
            }
        };

        Ok(Self {
            root,
            manifest_path,
            manifest: RwLock::new(std::sync::Arc::new(manifest)),
        })
    }

    fn snapshot(&self) -> std::sync::Arc<Manifest> {
        self.manifest
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Persist the current in-memory manifest atomically (temp + rename).
    fn persist(&self, manifest: &Manifest) -> Result<()> {
        let tmp = self.manifest_path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(manifest)
            .map_err(|e| AppError::Internal(format!("failed to serialize manifest: {e}")))?;
        std::fs::write(&tmp, text).map_err(IoError::Disk)?;
        std::fs::rename(&tmp, &self.manifest_path).map_err(IoError::Disk)?;
        Ok(())
    }

    fn replace(&self, new_manifest: Manifest) -> Result<()> {
        self.persist(&new_manifest)?;
        let mut guard = self
            .manifest
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = std::sync::Arc::new(new_manifest);
        Ok(())
    }

    /// Publish (or republish) a catalog entry. Used by discovery code that
    /// learns about a model from a remote index.
    pub fn publish(&self, info: ModelInfo) -> Result<()> {
        let mut manifest = (*self.snapshot()).clone();
        manifest.models.retain(|m| {
            !(m.model_id == info.model_id && m.version == info.version)
        });
        manifest.models.push(info);
        self.replace(manifest)
    }

    /// All catalog entries, optionally filtered by kind and/or device fit.
    #[must_use]
    pub fn list_available(
        &self,
        kind: Option<ModelKind>,
        device: Option<&DeviceProfile>,
    ) -> Vec<ModelInfo> {
        let manifest = self.snapshot();
        manifest
            .models
            .iter()
            .filter(|m| kind.is_none_or(|k| m.kind == k))
            .filter(|m| device.is_none_or(|d| fits_device(m, d)))
            .cloned()
            .collect()
    }

    /// Catalog entries whose model file is present on disk at the expected
    /// layout path (`<root>/<model_id>/<version>/model.bin`).
    #[must_use]
    pub fn list_downloaded(&self) -> Vec<ModelInfo> {
        let manifest = self.snapshot();
        manifest
            .models
            .iter()
            .filter(|m| self.model_path(&m.model_id, &m.version).exists())
            .cloned()
            .collect()
    }

    /// Look up a catalog entry by id, preferring the pinned version if one
    /// exists, otherwise the newest published version.
    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<ModelInfo> {
        let manifest = self.snapshot();
        if let Some(pinned_version) = manifest.pins.get(model_id) {
            if let Some(m) = manifest
                .models
                .iter()
                .find(|m| m.model_id == model_id && &m.version == pinned_version)
            {
                return Some(m.clone());
            }
        }
        manifest
            .models
            .iter()
            .filter(|m| m.model_id == model_id)
            .max_by(|a, b| {
                a.parsed_version()
                    .cmp(&b.parsed_version())
            })
            .cloned()
    }

    /// Look up a specific `(model_id, version)` pair.
    #[must_use]
    pub fn get_version(&self, model_id: &str, version: &str) -> Option<ModelInfo> {
        self.snapshot()
            .models
            .iter()
            .find(|m| m.model_id == model_id && m.version == version)
            .cloned()
    }

    /// Pin `model_id` to `version`, forbidding silent replacement by
    /// `check_for_updates`. Fails `NotFound::Model` if the pair doesn't
    /// exist in the catalog.
    pub fn pin(&self, model_id: &str, version: &str) -> Result<()> {
        let mut manifest = (*self.snapshot()).clone();
        if !manifest
            .models
            .iter()
            .any(|m| m.model_id == model_id && m.version == version)
        {
            return Err(NotFoundError::Model(model_id.to_owned()).into());
        }
        manifest
            .pins
            .insert(model_id.to_owned(), version.to_owned());
        self.replace(manifest)
    }

    /// Remove a pin, if any. Always succeeds.
    pub fn unpin(&self, model_id: &str) -> Result<()> {
        let mut manifest = (*self.snapshot()).clone();
        manifest.pins.remove(model_id);
        self.replace(manifest)
    }

    /// Whether `model_id` currently has a pinned version.
    #[must_use]
    pub fn is_pinned(&self, model_id: &str) -> bool {
        self.snapshot().pins.contains_key(model_id)
    }

    /// The pinned version, if any.
    #[must_use]
    pub fn pinned_version(&self, model_id: &str) -> Option<String> {
        self.snapshot().pins.get(model_id).cloned()
    }

    /// Path a downloaded model's file would live at (final, not `.tmp`).
    #[must_use]
    pub fn model_path(&self, model_id: &str, version: &str) -> PathBuf {
        self.root.join(model_id).join(version).join("model.bin")
    }

    /// The storage root this registry is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether any version of `model_id` has a file present on disk.
    #[must_use]
    pub fn is_model_downloaded(&self, model_id: &str) -> bool {
        self.snapshot()
            .models
            .iter()
            .filter(|m| m.model_id == model_id)
            .any(|m| self.model_path(&m.model_id, &m.version).exists())
    }

    /// The on-disk path of `model_id`'s resolved version (pinned, else
    /// newest). Fails `NotFound::Model` if the model isn't in the catalog
    /// or has no file on disk yet.
    pub fn get_model_path(&self, model_id: &str) -> Result<PathBuf> {
        let info = self
            .get(model_id)
            .ok_or_else(|| NotFoundError::Model(model_id.to_owned()))?;
        let path = self.model_path(&info.model_id, &info.version);
        if !path.exists() {
            return Err(NotFoundError::Model(model_id.to_owned()).into());
        }
        Ok(path)
    }

    /// Every version of `model_id` published to the catalog, parsed and
    /// sorted ascending. Versions that fail to parse as semver are skipped.
    #[must_use]
    pub fn get_available_versions(&self, model_id: &str) -> Vec<Version> {
        let manifest = self.snapshot();
        let mut versions: Vec<Version> = manifest
            .models
            .iter()
            .filter(|m| m.model_id == model_id)
            .filter_map(|m| m.parsed_version())
            .collect();
        versions.sort();
        versions
    }

    /// Whether `version` is specifically the version currently pinned for
    /// `model_id` (as opposed to [`Registry::is_pinned`], which only asks
    /// whether any pin exists).
    #[must_use]
    pub fn is_model_version_pinned(&self, model_id: &str, version: &str) -> bool {
        self.snapshot().pins.get(model_id).map(String::as_str) == Some(version)
    }

    /// Aggregate storage usage across downloaded models.
    pub fn storage_info(&self) -> Result<StorageInfo> {
        let downloaded = self.list_downloaded();
        let mut per_model_bytes = HashMap::new();
        let mut used = 0u64;
        for m in &downloaded {
            let path = self.model_path(&m.model_id, &m.version);
            let size = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            used += size;
            *per_model_bytes.entry(m.model_id.clone()).or_insert(0) += size;
        }
        let available = crate::storage::free_bytes(&self.root)?;
        Ok(StorageInfo {
            used,
            available,
            per_model_bytes,
        })
    }

    /// Catalog entries suitable for `device`, filtered by both size and
    /// compute class (§4.3).
    #[must_use]
    pub fn recommend(&self, kind: ModelKind, device: &DeviceProfile) -> Vec<ModelInfo> {
        self.list_available(Some(kind), Some(device))
    }

    /// Compare the catalog's newest version for `model_id` against
    /// `local_version`; returns the newer [`ModelInfo`] if one exists and
    /// `model_id` isn't pinned, otherwise `None`.
    #[must_use]
    pub fn check_for_updates(&self, model_id: &str, local_version: &str) -> Option<ModelInfo> {
        if self.is_pinned(model_id) {
            return None;
        }
        let local = Version::parse(local_version).ok()?;
        let manifest = self.snapshot();
        manifest
            .models
            .iter()
            .filter(|m| m.model_id == model_id)
            .filter_map(|m| m.parsed_version().map(|v| (v, m)))
            .filter(|(v, _)| *v > local)
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, m)| m.clone())
    }
}

fn fits_device(model: &ModelInfo, device: &DeviceProfile) -> bool {
    let ram_budget = (device.ram_bytes as f64 * 0.4) as u64;
    model.size_bytes <= ram_budget && device.compute_class >= model.min_compute_class
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(model_id: &str, version: &str, size_bytes: u64) -> ModelInfo {
        ModelInfo {
            model_id: model_id.to_owned(),
            version: version.to_owned(),
            kind: ModelKind::Llm,
            size_bytes,
            url: format!("https://example.invalid/{model_id}/{version}/model.bin"),
            expected_sha256: "0".repeat(64),
            min_compute_class: 0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn publish_and_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        let got = reg.get("llm-a").expect("present");
        assert_eq!(got.version, "1.0.0");
    }

    #[test]
    fn get_prefers_newest_version_without_pin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        reg.publish(sample("llm-a", "1.2.0", 100)).expect("publish");
        let got = reg.get("llm-a").expect("present");
        assert_eq!(got.version, "1.2.0");
    }

    #[test]
    fn pin_forces_specific_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        reg.publish(sample("llm-a", "1.2.0", 100)).expect("publish");
        reg.pin("llm-a", "1.0.0").expect("pin");
        let got = reg.get("llm-a").expect("present");
        assert_eq!(got.version, "1.0.0");
        assert!(reg.is_pinned("llm-a"));
    }

    #[test]
    fn pin_unknown_version_fails_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        let err = reg.pin("llm-a", "9.9.9").unwrap_err();
        assert!(matches!(err, AppError::NotFound(NotFoundError::Model(_))));
    }

    #[test]
    fn check_for_updates_respects_pin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        reg.publish(sample("llm-a", "2.0.0", 100)).expect("publish");
        reg.pin("llm-a", "1.0.0").expect("pin");
        assert!(reg.check_for_updates("llm-a", "1.0.0").is_none());
        reg.unpin("llm-a").expect("unpin");
        let update = reg.check_for_updates("llm-a", "1.0.0").expect("update");
        assert_eq!(update.version, "2.0.0");
    }

    #[test]
    fn recommend_filters_by_ram_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("small", "1.0.0", 100)).expect("publish");
        reg.publish(sample("huge", "1.0.0", 10_000)).expect("publish");
        let device = DeviceProfile {
            ram_bytes: 1_000,
            compute_class: 5,
        };
        let recs = reg.recommend(ModelKind::Llm, &device);
        assert!(recs.iter().any(|m| m.model_id == "small"));
        assert!(!recs.iter().any(|m| m.model_id == "huge"));
    }

    #[test]
    fn manifest_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let reg = Registry::open(dir.path()).expect("open");
            reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
            reg.pin("llm-a", "1.0.0").expect("pin");
        }
        let reopened = Registry::open(dir.path()).expect("reopen");
        assert!(reopened.is_pinned("llm-a"));
        assert_eq!(reopened.get("llm-a").expect("present").version, "1.0.0");
    }

    #[test]
    fn is_model_downloaded_false_until_file_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        assert!(!reg.is_model_downloaded("llm-a"));
        let path = reg.model_path("llm-a", "1.0.0");
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, b"x").expect("write");
        assert!(reg.is_model_downloaded("llm-a"));
    }

    #[test]
    fn get_model_path_fails_not_found_when_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        let err = reg.get_model_path("missing").unwrap_err();
        assert!(matches!(err, AppError::NotFound(NotFoundError::Model(_))));

        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        let err = reg.get_model_path("llm-a").unwrap_err();
        assert!(matches!(err, AppError::NotFound(NotFoundError::Model(_))));

        let path = reg.model_path("llm-a", "1.0.0");
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, b"x").expect("write");
        assert_eq!(reg.get_model_path("llm-a").expect("now present"), path);
    }

    #[test]
    fn get_available_versions_sorted_ascending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.2.0", 100)).expect("publish");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        let versions: Vec<String> = reg
            .get_available_versions("llm-a")
            .iter()
            .map(Version::to_string)
            .collect();
        assert_eq!(versions, vec!["1.0.0".to_owned(), "1.2.0".to_owned()]);
    }

    #[test]
    fn is_model_version_pinned_is_version_specific() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        reg.publish(sample("llm-a", "2.0.0", 100)).expect("publish");
        reg.pin("llm-a", "1.0.0").expect("pin");
        assert!(reg.is_model_version_pinned("llm-a", "1.0.0"));
        assert!(!reg.is_model_version_pinned("llm-a", "2.0.0"));
    }

    #[test]
    fn unknown_manifest_fields_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"{"schema":1,"models":[],"pins":{},"future_field":"kept"}"#,
        )
        .expect("write");
        let reg = Registry::open(dir.path()).expect("open");
        reg.publish(sample("llm-a", "1.0.0", 100)).expect("publish");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("future_field"));
    }
}
